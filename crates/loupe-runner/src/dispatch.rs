//! The dispatch loop: turns the durable queue into sequential agent runs.
//!
//! One [`Dispatcher`] owns all orchestration state. It listens to queue
//! notifications to learn that work may be available, but always asks the
//! queue itself which task to run next. At most one agent runs at a time.
//! After each run the task is re-read: the agent is expected to have moved
//! it to `review` itself, and anything still `in_progress` is treated as a
//! crash and returned to `pending`.

use crate::backoff::Backoff;
use crate::client::{EventSource, EventStream, QueueClient};
use crate::launcher::{ActivitySink, AgentLauncher};
use crate::subprocess::{AgentError, AgentExit, ExitReason};
use anyhow::Result;
use futures_util::StreamExt;
use loupe_core::config::DispatchConfig;
use loupe_core::event::QueueEvent;
use loupe_core::prompt::{PromptContext, build_prompt};
use loupe_core::task::{Task, TaskId, TaskStatus, TaskUpdate, select_next_pending};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of one [`Dispatcher::try_dispatch`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// An agent is already running.
    Busy,
    /// Nothing eligible to run.
    Idle,
    /// Dispatch is suspended after the agent could not be started.
    Paused,
    /// A candidate was found but could not be claimed; left for a later cycle.
    Abandoned,
    Started(TaskId),
}

/// What a finished run left the task as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The agent reported back; a human reviews next.
    Review,
    /// Still `in_progress` after the agent exited; returned to `pending`.
    Crashed,
    /// Deleted while the agent ran.
    Missing,
    /// Any other status, left as found (e.g. `done` after a cancel).
    Left(TaskStatus),
}

type AgentResult = Result<Result<AgentExit, AgentError>, JoinError>;

struct RunningAgent {
    task_id: TaskId,
    cancel: CancellationToken,
    handle: JoinHandle<Result<AgentExit, AgentError>>,
    started: Instant,
}

enum Step {
    Shutdown,
    AgentDone(AgentResult),
    Event(QueueEvent),
    Disconnected,
    Connect,
    Resume,
}

pub struct Dispatcher {
    client: Arc<dyn QueueClient>,
    events: Arc<dyn EventSource>,
    launcher: Arc<dyn AgentLauncher>,
    prompt: PromptContext,
    config: DispatchConfig,
    /// Ids believed pending. Only gates whether to look; never chooses.
    hints: HashSet<TaskId>,
    /// Over-limit tasks already warned about.
    skipped: HashSet<TaskId>,
    running: Option<RunningAgent>,
    paused_until: Option<Instant>,
    /// Delay after consecutive runs that ended without a report.
    crash_backoff: Backoff,
    synced_once: bool,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn QueueClient>,
        events: Arc<dyn EventSource>,
        launcher: Arc<dyn AgentLauncher>,
        prompt: PromptContext,
        config: DispatchConfig,
    ) -> Self {
        let crash_backoff = Backoff::new(
            Duration::from_millis(config.crash_retry_base_ms),
            Duration::from_millis(config.crash_retry_max_ms),
        );
        Self {
            client,
            events,
            launcher,
            prompt,
            config,
            hints: HashSet::new(),
            skipped: HashSet::new(),
            running: None,
            paused_until: None,
            crash_backoff,
            synced_once: false,
        }
    }

    pub fn running_task(&self) -> Option<&TaskId> {
        self.running.as_ref().map(|agent| &agent.task_id)
    }

    pub fn hint_count(&self) -> usize {
        self.hints.len()
    }

    /// Run until `shutdown` fires, then [`stop`](Self::stop).
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            launcher = self.launcher.name(),
            max_retries = self.config.max_retries,
            "dispatcher started"
        );
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.reconnect_base_ms),
            Duration::from_millis(self.config.reconnect_max_ms),
        );
        let mut stream: Option<EventStream> = None;
        let mut reconnect_at = Instant::now();

        loop {
            let connected = stream.is_some();
            let agent_running = self.running.is_some();
            let pause = self.paused_until;

            let step = tokio::select! {
                _ = shutdown.cancelled() => Step::Shutdown,
                joined = wait_agent(&mut self.running), if agent_running => Step::AgentDone(joined),
                event = next_event(&mut stream), if connected => match event {
                    Some(event) => Step::Event(event),
                    None => Step::Disconnected,
                },
                _ = tokio::time::sleep_until(reconnect_at), if !connected => Step::Connect,
                _ = sleep_until_opt(pause), if pause.is_some() => Step::Resume,
            };

            match step {
                Step::Shutdown => break,
                Step::AgentDone(joined) => {
                    if let Some(agent) = self.running.take() {
                        self.reconcile(agent, joined).await;
                    }
                    self.dispatch_logged().await;
                }
                Step::Event(event) => {
                    if self.handle_event(&event) {
                        self.dispatch_logged().await;
                    }
                }
                Step::Disconnected => {
                    stream = None;
                    let delay = backoff.next_delay();
                    tracing::warn!(retry_in = ?delay, "event channel disconnected");
                    reconnect_at = Instant::now() + delay;
                }
                Step::Connect => match self.events.connect().await {
                    Ok(events) => match self.resync().await {
                        Ok(pending) => {
                            backoff.reset();
                            stream = Some(events);
                            tracing::info!(pending, "event channel connected");
                            self.dispatch_logged().await;
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            tracing::warn!(error = %e, retry_in = ?delay, "resync failed");
                            reconnect_at = Instant::now() + delay;
                        }
                    },
                    Err(e) => {
                        let delay = backoff.next_delay();
                        tracing::warn!(error = %e, retry_in = ?delay, "event channel connect failed");
                        reconnect_at = Instant::now() + delay;
                    }
                },
                Step::Resume => {
                    self.paused_until = None;
                    tracing::info!("dispatch resumed");
                    self.dispatch_logged().await;
                }
            }
        }

        self.stop().await;
        tracing::info!("dispatcher stopped");
        Ok(())
    }

    /// Rebuild the hint set from a full listing. Returns the number of
    /// eligible pending tasks.
    ///
    /// On the first sync, tasks left `in_progress` by a previous process are
    /// returned to `pending`; nothing can still be working on them.
    pub async fn resync(&mut self) -> Result<usize> {
        let tasks = self.client.list_tasks().await?;

        if !self.synced_once {
            self.synced_once = true;
            for task in tasks.iter().filter(|t| t.status == TaskStatus::InProgress) {
                if self.running_task() == Some(&task.id) {
                    continue;
                }
                tracing::warn!(task = %task.id, "returning orphaned in-progress task to pending");
                self.client
                    .update_task(&task.id, TaskUpdate::status(TaskStatus::Pending))
                    .await?;
                self.hints.insert(task.id.clone());
            }
        }

        self.hints.retain(|id| tasks.iter().any(|t| &t.id == id));
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Pending) {
            if task.within_retry_limit(self.config.max_retries) {
                self.hints.insert(task.id.clone());
            } else {
                self.hints.remove(&task.id);
                self.warn_skipped(task);
            }
        }
        Ok(self.hints.len())
    }

    /// Fold one notification into local state. Returns whether new work may
    /// be available.
    pub fn handle_event(&mut self, event: &QueueEvent) -> bool {
        match event {
            QueueEvent::TaskCreated { task } => {
                if task.status == TaskStatus::Pending {
                    self.hints.insert(task.id.clone());
                    return true;
                }
                false
            }
            QueueEvent::TaskUpdated { task } => {
                if task.status == TaskStatus::Pending {
                    self.hints.insert(task.id.clone());
                    true
                } else {
                    self.hints.remove(&task.id);
                    false
                }
            }
            QueueEvent::TaskDeleted { id } => {
                self.hints.remove(id);
                self.skipped.remove(id);
                self.terminate_if_running(id, "task deleted");
                false
            }
            QueueEvent::TaskCancel { id } => {
                self.hints.remove(id);
                self.terminate_if_running(id, "task cancelled");
                false
            }
            QueueEvent::TaskActivity { .. } => false,
        }
    }

    fn terminate_if_running(&self, id: &TaskId, why: &str) {
        if let Some(agent) = &self.running
            && &agent.task_id == id
        {
            tracing::info!(task = %id, reason = why, "terminating agent");
            agent.cancel.cancel();
        }
    }

    /// Start the next eligible task if nothing is running.
    pub async fn try_dispatch(&mut self) -> DispatchOutcome {
        if self.running.is_some() {
            return DispatchOutcome::Busy;
        }
        if let Some(until) = self.paused_until {
            if Instant::now() < until {
                return DispatchOutcome::Paused;
            }
            self.paused_until = None;
        }
        if self.hints.is_empty() {
            return DispatchOutcome::Idle;
        }

        let candidate = match self.client.next_pending().await {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.hints.clear();
                return DispatchOutcome::Idle;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to query next pending task");
                return DispatchOutcome::Abandoned;
            }
        };

        let task = if candidate.within_retry_limit(self.config.max_retries) {
            candidate
        } else {
            self.hints.remove(&candidate.id);
            self.warn_skipped(&candidate);
            match self.next_eligible().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    self.hints.clear();
                    return DispatchOutcome::Idle;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to list tasks");
                    return DispatchOutcome::Abandoned;
                }
            }
        };

        let claimed = match self
            .client
            .update_task(&task.id, TaskUpdate::status(TaskStatus::InProgress))
            .await
        {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                tracing::info!(task = %task.id, "task vanished before it could be claimed");
                self.hints.remove(&task.id);
                return DispatchOutcome::Abandoned;
            }
            Err(e) => {
                tracing::warn!(task = %task.id, error = %e, "failed to claim task");
                return DispatchOutcome::Abandoned;
            }
        };

        self.hints.remove(&claimed.id);
        self.start(claimed)
    }

    /// Fallback selection when the queue's own choice is over the retry
    /// limit: the same policy, restricted to eligible tasks.
    async fn next_eligible(&self) -> Result<Option<Task>> {
        let tasks = self.client.list_tasks().await?;
        let max = self.config.max_retries;
        Ok(select_next_pending(&tasks, |t| t.within_retry_limit(max)).cloned())
    }

    fn warn_skipped(&mut self, task: &Task) {
        if self.skipped.insert(task.id.clone()) {
            tracing::warn!(
                task = %task.id,
                attempts = task.attempts.len(),
                max_retries = self.config.max_retries,
                "retry limit reached, task stays pending until a human intervenes"
            );
        }
    }

    fn start(&mut self, task: Task) -> DispatchOutcome {
        let prompt = build_prompt(&task, &self.prompt);
        let cancel = CancellationToken::new();
        let sink = ActivitySink::new(Arc::clone(&self.client), task.id.clone());
        let launcher = Arc::clone(&self.launcher);
        let id = task.id.clone();
        let token = cancel.clone();

        tracing::info!(
            task = %task.id,
            priority = %task.priority,
            attempt = task.attempts.len() + 1,
            "dispatching task"
        );
        let handle = tokio::spawn(async move { launcher.run(&id, prompt, token, sink).await });

        self.running = Some(RunningAgent {
            task_id: task.id.clone(),
            cancel,
            handle,
            started: Instant::now(),
        });
        DispatchOutcome::Started(task.id)
    }

    /// Wait for the running agent, if any, and reconcile its task.
    pub async fn wait_current(&mut self) -> Option<Reconciled> {
        let mut agent = self.running.take()?;
        let joined = (&mut agent.handle).await;
        Some(self.reconcile(agent, joined).await)
    }

    async fn reconcile(&mut self, agent: RunningAgent, joined: AgentResult) -> Reconciled {
        let id = agent.task_id;
        let elapsed = agent.started.elapsed();

        match joined {
            Ok(Ok(exit)) => match exit.reason {
                ExitReason::Exited => {
                    tracing::info!(task = %id, exit_code = ?exit.exit_code, ?elapsed, "agent exited")
                }
                ExitReason::TimedOut => {
                    tracing::warn!(task = %id, ?elapsed, "agent exceeded its time budget")
                }
                ExitReason::Cancelled => tracing::info!(task = %id, "agent stopped"),
            },
            Ok(Err(AgentError::Spawn { command, source })) => {
                let pause = Duration::from_secs(self.config.spawn_retry_secs);
                tracing::error!(
                    task = %id,
                    %command,
                    error = %source,
                    retry_in = ?pause,
                    "could not start the agent; install the CLI or set `agent.command` in loupe.toml"
                );
                self.pause_for(pause);
            }
            Ok(Err(e)) => tracing::warn!(task = %id, error = %e, "agent run failed"),
            Err(e) => tracing::error!(task = %id, error = %e, "agent task panicked"),
        }

        match self.client.get_task(&id).await {
            Ok(Some(task)) => match task.status {
                TaskStatus::Review => {
                    tracing::info!(
                        task = %id,
                        ?elapsed,
                        notes = task.agent_notes.as_deref().unwrap_or(""),
                        files = task.files_modified.len(),
                        "task ready for review"
                    );
                    self.crash_backoff.reset();
                    Reconciled::Review
                }
                TaskStatus::InProgress => {
                    let pause = self.crash_backoff.next_delay();
                    tracing::warn!(
                        task = %id,
                        retry_in = ?pause,
                        "agent exited without reporting, returning task to pending"
                    );
                    self.revert_to_pending(&id).await;
                    self.pause_for(pause);
                    Reconciled::Crashed
                }
                other => {
                    tracing::info!(task = %id, status = %other, "task left as found");
                    Reconciled::Left(other)
                }
            },
            Ok(None) => {
                tracing::info!(task = %id, "task was deleted while the agent ran");
                Reconciled::Missing
            }
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "could not re-read task after run");
                Reconciled::Left(TaskStatus::InProgress)
            }
        }
    }

    /// Suspend dispatch for at least `pause`; never shortens a longer pause.
    fn pause_for(&mut self, pause: Duration) {
        let until = Instant::now() + pause;
        self.paused_until = Some(self.paused_until.map_or(until, |current| current.max(until)));
    }

    async fn revert_to_pending(&mut self, id: &TaskId) {
        match self
            .client
            .update_task(id, TaskUpdate::status(TaskStatus::Pending))
            .await
        {
            Ok(Some(_)) => {
                self.hints.insert(id.clone());
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(task = %id, error = %e, "failed to return task to pending"),
        }
    }

    async fn dispatch_logged(&mut self) {
        let outcome = self.try_dispatch().await;
        tracing::debug!(?outcome, "dispatch cycle");
    }

    /// Stop the running agent, if any, and return its task to the queue.
    ///
    /// Waits up to `shutdown_grace_secs` for the agent to exit, then aborts
    /// it; the child process is killed when its handle is dropped.
    pub async fn stop(&mut self) {
        let Some(agent) = self.running.take() else {
            return;
        };
        let RunningAgent {
            task_id,
            cancel,
            mut handle,
            ..
        } = agent;

        tracing::info!(task = %task_id, "stopping running agent");
        cancel.cancel();
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            tracing::warn!(task = %task_id, ?grace, "agent did not stop in time, aborting");
            handle.abort();
            let _ = handle.await;
        }

        match self.client.get_task(&task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::InProgress => {
                self.revert_to_pending(&task_id).await;
                tracing::info!(task = %task_id, "task returned to pending for the next run");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(task = %task_id, error = %e, "could not re-read task on shutdown"),
        }
    }
}

async fn wait_agent(running: &mut Option<RunningAgent>) -> AgentResult {
    match running {
        Some(agent) => (&mut agent.handle).await,
        None => std::future::pending().await,
    }
}

async fn next_event(stream: &mut Option<EventStream>) -> Option<QueueEvent> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
