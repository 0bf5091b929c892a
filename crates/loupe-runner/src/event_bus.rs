//! Broadcast-based event bus for queue notifications.
//!
//! Wraps `tokio::sync::broadcast` so multiple consumers (dispatcher, SSE
//! clients, the review UI) each receive their own copy of every event. Slow
//! consumers are dropped gracefully via the channel's lag mechanism.
//!
//! Also owns the ephemeral per-task activity log: progress lines for tasks
//! that are `in_progress`, kept in memory only.

use loupe_core::event::{ActivityEntry, QueueEvent};
use loupe_core::task::TaskId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Channel capacity: enough to absorb an agent's activity burst.
const DEFAULT_CAPACITY: usize = 1024;

/// Activity entries retained per task; older ones are dropped first.
pub const ACTIVITY_LIMIT: usize = 500;

type ActivityLog = HashMap<TaskId, Vec<ActivityEntry>>;

/// Central event bus.
///
/// Clone-friendly via internal `Arc`. All clones share the same channel and
/// activity log.
#[derive(Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<QueueEvent>>,
    activity: Arc<Mutex<ActivityLog>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx: Arc::new(tx),
            activity: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Emit an event to all current subscribers.
    ///
    /// No subscribers is not an error; there is no replay for late joiners.
    pub fn emit(&self, event: QueueEvent) {
        tracing::trace!(event = event.name(), task = %event.task_id(), "emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted from now on.
    ///
    /// A subscriber that falls more than the channel capacity behind gets
    /// `RecvError::Lagged` and loses the skipped events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Append a progress line and broadcast it as `task_activity`.
    pub fn record_activity(&self, id: &TaskId, entry: ActivityEntry) {
        {
            let mut log = self.log();
            let entries = log.entry(id.clone()).or_default();
            entries.push(entry.clone());
            if entries.len() > ACTIVITY_LIMIT {
                let excess = entries.len() - ACTIVITY_LIMIT;
                entries.drain(..excess);
            }
        }
        self.emit(QueueEvent::TaskActivity {
            id: id.clone(),
            entry,
        });
    }

    /// Snapshot of a task's activity, oldest first.
    pub fn activity(&self, id: &TaskId) -> Vec<ActivityEntry> {
        self.log().get(id).cloned().unwrap_or_default()
    }

    pub fn clear_activity(&self, id: &TaskId) {
        if self.log().remove(id).is_some() {
            tracing::debug!(task = %id, "activity cleared");
        }
    }

    fn log(&self) -> MutexGuard<'_, ActivityLog> {
        self.activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
