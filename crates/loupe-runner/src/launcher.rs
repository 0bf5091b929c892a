//! Agent launch seam and the progress sink handed to a run.

use crate::client::QueueClient;
use crate::subprocess::{AgentError, AgentExit};
use async_trait::async_trait;
use loupe_core::event::ActivityEntry;
use loupe_core::task::TaskId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Something that can work on one task given its prompt.
///
/// Implementations must return once `cancel` fires, after stopping whatever
/// they started.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Executable or backend name, for logs.
    fn name(&self) -> &str;

    async fn run(
        &self,
        task_id: &TaskId,
        prompt: String,
        cancel: CancellationToken,
        sink: ActivitySink,
    ) -> Result<AgentExit, AgentError>;
}

/// Forwards a run's progress lines to the queue without blocking the run.
///
/// Entries go through one background task, so they reach the queue in the
/// order they were sent. Failures are logged and dropped. The task ends once
/// every clone of the sink is gone. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct ActivitySink {
    tx: mpsc::UnboundedSender<ActivityEntry>,
    task_id: TaskId,
}

impl ActivitySink {
    pub fn new(client: Arc<dyn QueueClient>, task_id: TaskId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ActivityEntry>();
        let id = task_id.clone();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = client.post_activity(&id, entry).await {
                    tracing::warn!(task = %id, error = %e, "failed to post activity");
                }
            }
        });
        Self { tx, task_id }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn send(&self, entry: ActivityEntry) {
        if self.tx.send(entry).is_err() {
            tracing::debug!(task = %self.task_id, "activity forwarder gone, entry dropped");
        }
    }
}
