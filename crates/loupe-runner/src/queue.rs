//! In-process queue service: the store plus the bus.
//!
//! Every mutation persists first and broadcasts second, so a subscriber that
//! reacts to an event and re-reads the store always sees the change.

use crate::client::{EventSource, EventStream, QueueClient};
use crate::event_bus::EventBus;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use loupe_core::error::QueueError;
use loupe_core::event::{ActivityEntry, QueueEvent};
use loupe_core::task::{NewTask, StatusCounts, Task, TaskId, TaskStatus, TaskUpdate};
use loupe_db::queue_store::QueueStore;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The task was running; it is now `done` and the dispatcher was told.
    Cancelled(Task),
    /// The task exists but was not `in_progress`.
    NotRunning(Task),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    Recorded,
    NotRunning,
    NotFound,
}

/// Queue store with notifications. Cheap to clone.
#[derive(Clone)]
pub struct LocalQueue {
    store: Arc<QueueStore>,
    bus: EventBus,
    /// Held across a status check plus activity append, and across a status
    /// write plus activity clear, so no entry lands after the clear.
    activity_gate: Arc<Mutex<()>>,
}

impl LocalQueue {
    pub fn new(store: QueueStore, bus: EventBus) -> Self {
        Self {
            store: Arc::new(store),
            bus,
            activity_gate: Arc::new(Mutex::new(())),
        }
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.activity_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the store under `data_dir` with a fresh bus.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        Ok(Self::new(QueueStore::open(data_dir)?, EventBus::new()))
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Event source backed by this queue's bus.
    pub fn events(&self) -> LocalEvents {
        LocalEvents {
            bus: self.bus.clone(),
        }
    }

    pub fn create(&self, input: NewTask) -> Result<Task, QueueError> {
        let task = self.store.add(input)?;
        self.bus.emit(QueueEvent::TaskCreated { task: task.clone() });
        Ok(task)
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.store.get(id)
    }

    pub fn list(&self) -> Vec<Task> {
        self.store.list()
    }

    pub fn next_pending(&self) -> Option<Task> {
        self.store.next_pending()
    }

    pub fn status_counts(&self) -> StatusCounts {
        self.store.status_counts()
    }

    /// Apply an update. Activity is kept only while the task stays
    /// `in_progress`.
    pub fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<Option<Task>, QueueError> {
        let task = {
            let _gate = self.gate();
            let Some(task) = self.store.update(id, update)? else {
                return Ok(None);
            };
            if task.status != TaskStatus::InProgress {
                self.bus.clear_activity(id);
            }
            task
        };
        self.bus.emit(QueueEvent::TaskUpdated { task: task.clone() });
        Ok(Some(task))
    }

    pub fn delete(&self, id: &TaskId) -> Result<bool, QueueError> {
        let removed = {
            let _gate = self.gate();
            let removed = self.store.delete(id)?;
            if removed {
                self.bus.clear_activity(id);
            }
            removed
        };
        if removed {
            self.bus.emit(QueueEvent::TaskDeleted { id: id.clone() });
        }
        Ok(removed)
    }

    pub fn save_after_screenshot(
        &self,
        id: &TaskId,
        bytes: &[u8],
    ) -> Result<Option<Task>, QueueError> {
        let task = self.store.save_after_screenshot(id, bytes)?;
        if let Some(task) = &task {
            self.bus.emit(QueueEvent::TaskUpdated { task: task.clone() });
        }
        Ok(task)
    }

    /// Human retry from `review`.
    pub fn retry(&self, id: &TaskId, reason: &str) -> Result<Option<Task>, QueueError> {
        let task = self.store.retry(id, reason)?;
        if let Some(task) = &task {
            self.bus.emit(QueueEvent::TaskUpdated { task: task.clone() });
        }
        Ok(task)
    }

    /// Stop a running task: mark it `done` and tell the dispatcher to kill
    /// the agent.
    pub fn cancel(&self, id: &TaskId) -> Result<CancelOutcome, QueueError> {
        let task = {
            let _gate = self.gate();
            let Some(current) = self.store.get(id) else {
                return Ok(CancelOutcome::NotFound);
            };
            if current.status != TaskStatus::InProgress {
                return Ok(CancelOutcome::NotRunning(current));
            }
            let Some(task) = self.store.update(id, TaskUpdate::status(TaskStatus::Done))? else {
                return Ok(CancelOutcome::NotFound);
            };
            self.bus.clear_activity(id);
            task
        };
        self.bus.emit(QueueEvent::TaskCancel { id: id.clone() });
        self.bus.emit(QueueEvent::TaskUpdated { task: task.clone() });
        tracing::info!(task = %id, "task cancelled");
        Ok(CancelOutcome::Cancelled(task))
    }

    /// Record a progress line for a running task.
    pub fn push_activity(&self, id: &TaskId, entry: ActivityEntry) -> ActivityOutcome {
        let _gate = self.gate();
        match self.store.get(id) {
            None => ActivityOutcome::NotFound,
            Some(task) if task.status != TaskStatus::InProgress => ActivityOutcome::NotRunning,
            Some(_) => {
                self.bus.record_activity(id, entry);
                ActivityOutcome::Recorded
            }
        }
    }

    /// Activity for a task, `None` if the task does not exist.
    pub fn activity(&self, id: &TaskId) -> Option<Vec<ActivityEntry>> {
        self.store.get(id).map(|_| self.bus.activity(id))
    }
}

#[async_trait]
impl QueueClient for LocalQueue {
    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.list())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.get(id))
    }

    async fn next_pending(&self) -> Result<Option<Task>> {
        Ok(LocalQueue::next_pending(self))
    }

    async fn update_task(&self, id: &TaskId, update: TaskUpdate) -> Result<Option<Task>> {
        Ok(self.update(id, update)?)
    }

    async fn post_activity(&self, id: &TaskId, entry: ActivityEntry) -> Result<()> {
        match self.push_activity(id, entry) {
            ActivityOutcome::Recorded => Ok(()),
            ActivityOutcome::NotRunning => anyhow::bail!("task {id} is not in progress"),
            ActivityOutcome::NotFound => anyhow::bail!("task {id} not found"),
        }
    }
}

/// Subscription to an in-process [`EventBus`].
#[derive(Clone)]
pub struct LocalEvents {
    bus: EventBus,
}

impl LocalEvents {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl EventSource for LocalEvents {
    async fn connect(&self) -> Result<EventStream> {
        // A lagged receiver has lost events; ending the stream makes the
        // consumer reconnect and resynchronize.
        let stream = BroadcastStream::new(self.bus.subscribe())
            .take_while(|item| {
                let keep = match item {
                    Ok(_) => true,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagged");
                        false
                    }
                };
                std::future::ready(keep)
            })
            .filter_map(|item| std::future::ready(item.ok()));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use loupe_core::event::ActivityKind;
    use loupe_core::task::{PageInfo, TaskKind};
    use loupe_db::artifact_store::PNG_SIGNATURE;

    fn queue() -> (tempfile::TempDir, LocalQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = LocalQueue::open(dir.path()).unwrap();
        (dir, queue)
    }

    fn input() -> NewTask {
        NewTask::new(
            TaskKind::Page,
            "fix it",
            base64::engine::general_purpose::STANDARD.encode(PNG_SIGNATURE),
            PageInfo {
                url: "http://localhost/".into(),
                ..PageInfo::default()
            },
        )
    }

    #[tokio::test]
    async fn mutations_broadcast_after_persisting() {
        let (_dir, queue) = queue();
        let mut rx = queue.bus().subscribe();

        let task = queue.create(input()).unwrap();
        match rx.recv().await.unwrap() {
            QueueEvent::TaskCreated { task: created } => {
                assert_eq!(created.id, task.id);
                assert!(queue.get(&created.id).is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }

        queue
            .update(&task.id, TaskUpdate::status(TaskStatus::Review))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().name(), "task_updated");

        assert!(queue.delete(&task.id).unwrap());
        assert_eq!(rx.recv().await.unwrap().name(), "task_deleted");
    }

    #[tokio::test]
    async fn cancel_running_task() {
        let (_dir, queue) = queue();
        let task = queue.create(input()).unwrap();
        queue
            .update(&task.id, TaskUpdate::status(TaskStatus::InProgress))
            .unwrap();
        assert_eq!(
            queue.push_activity(&task.id, ActivityEntry::new(ActivityKind::Text, "thinking")),
            ActivityOutcome::Recorded
        );

        let mut rx = queue.bus().subscribe();
        let outcome = queue.cancel(&task.id).unwrap();
        assert!(matches!(outcome, CancelOutcome::Cancelled(ref t) if t.status == TaskStatus::Done));
        assert_eq!(rx.recv().await.unwrap().name(), "task_cancel");
        assert_eq!(rx.recv().await.unwrap().name(), "task_updated");
        assert_eq!(queue.activity(&task.id), Some(vec![]));

        assert!(matches!(
            queue.cancel(&task.id).unwrap(),
            CancelOutcome::NotRunning(_)
        ));
        assert_eq!(
            queue.cancel(&TaskId::from("nope")).unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[test]
    fn activity_requires_running_task() {
        let (_dir, queue) = queue();
        let task = queue.create(input()).unwrap();
        let entry = ActivityEntry::new(ActivityKind::Text, "x");
        assert_eq!(
            queue.push_activity(&task.id, entry.clone()),
            ActivityOutcome::NotRunning
        );
        assert_eq!(
            queue.push_activity(&TaskId::from("missing"), entry),
            ActivityOutcome::NotFound
        );
        assert!(queue.activity(&TaskId::from("missing")).is_none());
    }

    #[test]
    fn leaving_in_progress_discards_activity() {
        let (_dir, queue) = queue();
        let task = queue.create(input()).unwrap();
        queue
            .update(&task.id, TaskUpdate::status(TaskStatus::InProgress))
            .unwrap();
        queue.push_activity(&task.id, ActivityEntry::new(ActivityKind::Text, "a"));
        assert_eq!(queue.activity(&task.id).unwrap().len(), 1);

        queue
            .update(&task.id, TaskUpdate::status(TaskStatus::Review))
            .unwrap();
        assert!(queue.activity(&task.id).unwrap().is_empty());
    }

    #[test]
    fn cancel_racing_activity_leaves_no_entries() {
        for _ in 0..50 {
            let (_dir, queue) = queue();
            let task = queue.create(input()).unwrap();
            queue
                .update(&task.id, TaskUpdate::status(TaskStatus::InProgress))
                .unwrap();

            let poster = {
                let queue = queue.clone();
                let id = task.id.clone();
                std::thread::spawn(move || {
                    let entry = ActivityEntry::new(ActivityKind::Text, "working");
                    while queue.push_activity(&id, entry.clone()) == ActivityOutcome::Recorded {}
                })
            };
            std::thread::sleep(std::time::Duration::from_millis(1));
            assert!(matches!(
                queue.cancel(&task.id).unwrap(),
                CancelOutcome::Cancelled(_)
            ));
            poster.join().unwrap();

            assert_eq!(queue.activity(&task.id), Some(vec![]));
        }
    }

    #[test]
    fn review_racing_activity_leaves_no_entries() {
        let (_dir, queue) = queue();
        let task = queue.create(input()).unwrap();
        queue
            .update(&task.id, TaskUpdate::status(TaskStatus::InProgress))
            .unwrap();

        let poster = {
            let queue = queue.clone();
            let id = task.id.clone();
            std::thread::spawn(move || {
                let entry = ActivityEntry::new(ActivityKind::ToolStart, "Edit: a.tsx");
                while queue.push_activity(&id, entry.clone()) == ActivityOutcome::Recorded {}
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(1));
        queue
            .update(&task.id, TaskUpdate::status(TaskStatus::Review))
            .unwrap();
        poster.join().unwrap();

        assert!(queue.activity(&task.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_events_deliver_and_end_on_lag() {
        let dir = tempfile::tempdir().unwrap();
        let queue = LocalQueue::new(
            QueueStore::open(dir.path()).unwrap(),
            EventBus::with_capacity(2),
        );
        let mut stream = queue.events().connect().await.unwrap();

        queue.bus().emit(QueueEvent::TaskDeleted { id: TaskId::from("a") });
        assert_eq!(stream.next().await.unwrap().name(), "task_deleted");

        for i in 0..5 {
            queue.bus().emit(QueueEvent::TaskDeleted {
                id: TaskId(format!("t{i}")),
            });
        }
        assert!(stream.next().await.is_none());
    }
}
