//! Seams between the dispatch loop and the queue it drives.
//!
//! The dispatcher never touches storage directly. It talks to a
//! [`QueueClient`] for reads and writes and to an [`EventSource`] for
//! notifications, so the same loop runs in-process next to the server or as
//! a separate process against its HTTP API.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;
use loupe_core::event::{ActivityEntry, QueueEvent};
use loupe_core::task::{Task, TaskId, TaskUpdate};
use std::pin::Pin;

/// Queue notifications. The stream ending means the channel disconnected.
pub type EventStream = Pin<Box<dyn Stream<Item = QueueEvent> + Send>>;

/// Read/write access to the queue.
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;

    /// The queue's own choice of next pending task.
    async fn next_pending(&self) -> Result<Option<Task>>;

    /// Apply an update. `None` when the task does not exist.
    async fn update_task(&self, id: &TaskId, update: TaskUpdate) -> Result<Option<Task>>;

    async fn post_activity(&self, id: &TaskId, entry: ActivityEntry) -> Result<()>;
}

/// A subscribable feed of queue notifications.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a new subscription. Only events after this call are delivered.
    async fn connect(&self) -> Result<EventStream>;
}
