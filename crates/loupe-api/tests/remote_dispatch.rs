//! A dispatcher in "another process": HTTP client and SSE subscription
//! against a live server.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::StreamExt;
use loupe_api::{ApiState, serve_listener};
use loupe_core::config::DispatchConfig;
use loupe_core::event::{ActivityEntry, ActivityKind, QueueEvent};
use loupe_core::prompt::PromptContext;
use loupe_core::task::{NewTask, PageInfo, Priority, TaskId, TaskKind, TaskStatus, TaskUpdate};
use loupe_db::artifact_store::PNG_SIGNATURE;
use loupe_runner::http::{HttpEvents, HttpQueue};
use loupe_runner::subprocess::{AgentError, AgentExit, ExitReason};
use loupe_runner::{ActivitySink, AgentLauncher, Dispatcher, EventSource, QueueClient};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Server {
    state: Arc<ApiState>,
    url: String,
    shutdown: CancellationToken,
    dir: tempfile::TempDir,
}

async fn start_server() -> Server {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(ApiState::open(dir.path()).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let shutdown = CancellationToken::new();
    tokio::spawn(serve_listener(state.clone(), listener, shutdown.clone()));
    Server {
        state,
        url,
        shutdown,
        dir,
    }
}

fn new_task(note: &str, priority: Priority) -> NewTask {
    let mut png = PNG_SIGNATURE.to_vec();
    png.extend_from_slice(note.as_bytes());
    let page = PageInfo {
        url: "http://localhost:5173/settings".into(),
        title: "Settings".into(),
        viewport: None,
    };
    NewTask::new(TaskKind::Page, note, STANDARD.encode(png), page).with_priority(priority)
}

/// Posts one progress line, then reports back over HTTP like the real agent.
struct ReportingAgent {
    server: HttpQueue,
}

#[async_trait]
impl AgentLauncher for ReportingAgent {
    fn name(&self) -> &str {
        "reporting"
    }

    async fn run(
        &self,
        task_id: &TaskId,
        _prompt: String,
        _cancel: CancellationToken,
        sink: ActivitySink,
    ) -> Result<AgentExit, AgentError> {
        sink.send(ActivityEntry::new(ActivityKind::ToolStart, "Edit: src/Settings.tsx"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let update = TaskUpdate {
            status: Some(TaskStatus::Review),
            agent_notes: Some("aligned the toggles".into()),
            files_modified: Some(vec!["src/Settings.tsx".into()]),
            ..TaskUpdate::default()
        };
        self.server
            .update_task(task_id, update)
            .await
            .map_err(|e| AgentError::Io(std::io::Error::other(e.to_string())))?;
        Ok(AgentExit {
            reason: ExitReason::Exited,
            exit_code: Some(0),
            elapsed: Duration::from_millis(50),
        })
    }
}

async fn wait_for_status(queue: &HttpQueue, id: &TaskId, status: TaskStatus) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(task) = queue.get_task(id).await.unwrap()
                && task.status == status
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never reached {status}"));
}

#[tokio::test]
async fn http_client_maps_missing_to_none() {
    let server = start_server().await;
    let client = HttpQueue::new(server.url.clone()).unwrap();

    assert!(client.list_tasks().await.unwrap().is_empty());
    assert!(client.next_pending().await.unwrap().is_none());
    let missing = TaskId::from("missing");
    assert!(client.get_task(&missing).await.unwrap().is_none());
    assert!(
        client
            .update_task(&missing, TaskUpdate::status(TaskStatus::Done))
            .await
            .unwrap()
            .is_none()
    );

    let low = server.state.queue.create(new_task("low", Priority::Low)).unwrap();
    let high = server.state.queue.create(new_task("high", Priority::High)).unwrap();
    assert_eq!(client.next_pending().await.unwrap().unwrap().id, high.id);
    assert_eq!(client.list_tasks().await.unwrap().len(), 2);
    assert_eq!(client.get_task(&low.id).await.unwrap().unwrap().note, "low");

    server.shutdown.cancel();
}

#[tokio::test]
async fn http_mutations_reach_the_server_bus() {
    let server = start_server().await;
    let client = HttpQueue::new(server.url.clone()).unwrap();
    let mut rx = server.state.queue.bus().subscribe();

    let task = client
        .create_task(&new_task("header overlaps", Priority::High))
        .await
        .unwrap();
    assert!(matches!(rx.recv().await.unwrap(), QueueEvent::TaskCreated { task: ref t } if t.id == task.id));

    // Only reviewed tasks can be retried; the server's message comes through
    let err = client.retry_task(&task.id, "too early").await.unwrap_err();
    assert!(err.to_string().contains("409"), "got: {err}");

    server
        .state
        .queue
        .update(&task.id, TaskUpdate::status(TaskStatus::Review))
        .unwrap();
    assert_eq!(rx.recv().await.unwrap().name(), "task_updated");

    let retried = client
        .retry_task(&task.id, "still overlapping")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.attempts[0].rejection_reason, "still overlapping");
    assert!(matches!(rx.recv().await.unwrap(), QueueEvent::TaskUpdated { task: ref t } if t.status == TaskStatus::Pending));

    assert!(client.delete_task(&task.id).await.unwrap());
    assert_eq!(
        rx.recv().await.unwrap(),
        QueueEvent::TaskDeleted { id: task.id.clone() }
    );
    assert!(!client.delete_task(&task.id).await.unwrap());
    assert!(client.retry_task(&task.id, "gone").await.unwrap().is_none());

    server.shutdown.cancel();
}

#[tokio::test]
async fn sse_subscription_decodes_queue_events() {
    let server = start_server().await;
    let events = HttpEvents::new(server.url.clone()).unwrap();
    let mut stream = events.connect().await.unwrap();

    // The handler subscribes before the response headers are sent
    let task = server.state.queue.create(new_task("first", Priority::Medium)).unwrap();
    server.state.queue.delete(&task.id).unwrap();

    let created = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(created, QueueEvent::TaskCreated { task: ref t } if t.id == task.id));
    let deleted = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deleted, QueueEvent::TaskDeleted { id: task.id.clone() });

    // Server shutdown ends the stream, which the dispatcher treats as a disconnect
    server.shutdown.cancel();
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while stream.next().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok());
}

#[tokio::test]
async fn remote_dispatcher_runs_task_to_review() {
    let server = start_server().await;
    let client = HttpQueue::new(server.url.clone()).unwrap();
    let task = server.state.queue.create(new_task("toggles misaligned", Priority::High)).unwrap();

    let mut dispatcher = Dispatcher::new(
        Arc::new(client.clone()),
        Arc::new(HttpEvents::new(server.url.clone()).unwrap()),
        Arc::new(ReportingAgent {
            server: client.clone(),
        }),
        PromptContext::new(server.dir.path().to_path_buf()),
        DispatchConfig::default(),
    );
    let stop = CancellationToken::new();
    let run = tokio::spawn({
        let stop = stop.clone();
        async move { dispatcher.run(stop).await }
    });

    wait_for_status(&client, &task.id, TaskStatus::Review).await;
    let reviewed = client.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(reviewed.agent_notes.as_deref(), Some("aligned the toggles"));
    assert_eq!(reviewed.files_modified, vec!["src/Settings.tsx".to_string()]);
    assert!(reviewed.attempts.is_empty());

    // A task created while the dispatcher is idle is picked up from the stream
    let second = server.state.queue.create(new_task("second", Priority::Low)).unwrap();
    wait_for_status(&client, &second.id, TaskStatus::Review).await;

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    server.shutdown.cancel();
}
