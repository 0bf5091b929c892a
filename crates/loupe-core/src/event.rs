//! Queue notification and activity types.
//!
//! Events are emitted whenever the queue is mutated. Consumers (the dispatch
//! loop, the SSE endpoint, the review UI) subscribe and react to them.
//!
//! These are pure data types with no async runtime dependency; the
//! broadcast bus lives in `loupe-runner`.

use crate::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a progress line describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ToolStart,
    ToolEnd,
    Text,
    Error,
    Result,
}

impl ActivityKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActivityKind::ToolStart => "tool_start",
            ActivityKind::ToolEnd => "tool_end",
            ActivityKind::Text => "text",
            ActivityKind::Error => "error",
            ActivityKind::Result => "result",
        }
    }
}

/// One ephemeral progress line for a task that is `in_progress`.
///
/// Never persisted in the queue document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
    pub summary: String,
}

impl ActivityEntry {
    pub fn new(kind: ActivityKind, summary: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            summary: summary.into(),
        }
    }
}

/// A queue mutation notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    TaskCreated { task: Task },
    TaskUpdated { task: Task },
    TaskDeleted { id: TaskId },
    TaskActivity { id: TaskId, entry: ActivityEntry },
    TaskCancel { id: TaskId },
}

impl QueueEvent {
    /// Event name used on the push channel.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::TaskCreated { .. } => "task_created",
            QueueEvent::TaskUpdated { .. } => "task_updated",
            QueueEvent::TaskDeleted { .. } => "task_deleted",
            QueueEvent::TaskActivity { .. } => "task_activity",
            QueueEvent::TaskCancel { .. } => "task_cancel",
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            QueueEvent::TaskCreated { task } | QueueEvent::TaskUpdated { task } => &task.id,
            QueueEvent::TaskDeleted { id }
            | QueueEvent::TaskActivity { id, .. }
            | QueueEvent::TaskCancel { id } => id,
        }
    }
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEvent::TaskCreated { task } => {
                write!(f, "{} created ({}, {})", task.id, task.kind, task.priority)
            }
            QueueEvent::TaskUpdated { task } => write!(f, "{} -> {}", task.id, task.status),
            QueueEvent::TaskDeleted { id } => write!(f, "{id} deleted"),
            QueueEvent::TaskActivity { id, entry } => {
                write!(f, "{id} [{}] {}", entry.kind.label(), entry.summary)
            }
            QueueEvent::TaskCancel { id } => write!(f, "{id} cancel requested"),
        }
    }
}
