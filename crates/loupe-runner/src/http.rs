//! HTTP implementations of the dispatcher seams, for running the dispatch
//! loop against a `loupe serve` instance in another process.

use crate::client::{EventSource, EventStream, QueueClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use loupe_core::event::{ActivityEntry, QueueEvent};
use loupe_core::task::{NewTask, Task, TaskId, TaskUpdate};
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::time::Duration;

const API_PREFIX: &str = "/api/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Event name the server uses to say this subscriber missed events.
pub const LAGGED_EVENT: &str = "lagged";

fn api_url(server: &str, path: &str) -> String {
    format!("{}{API_PREFIX}{path}", server.trim_end_matches('/'))
}

/// Queue access over the REST API.
#[derive(Clone)]
pub struct HttpQueue {
    client: reqwest::Client,
    server: String,
}

impl HttpQueue {
    pub fn new(server: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            server: server.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        api_url(&self.server, path)
    }

    /// GET a JSON resource; a 404 maps to `None`.
    async fn get_optional<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context(format!("GET {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .context(format!("GET {url}"))?;
        Ok(Some(
            response
                .json()
                .await
                .context(format!("invalid response from {url}"))?,
        ))
    }

    /// Add a task; the server broadcasts `task_created`.
    pub async fn create_task(&self, input: &NewTask) -> Result<Task> {
        let url = self.url("/tasks");
        let response = self
            .client
            .post(&url)
            .json(input)
            .send()
            .await
            .context(format!("POST {url}"))?;
        let response = checked(response, &url).await?;
        response.json().await.context("invalid task in response")
    }

    /// Send a reviewed task back to the queue. `None` when the id is unknown.
    pub async fn retry_task(&self, id: &TaskId, reason: &str) -> Result<Option<Task>> {
        let url = self.url(&format!("/tasks/{id}/retry"));
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await
            .context(format!("POST {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = checked(response, &url).await?;
        Ok(Some(response.json().await.context("invalid task in response")?))
    }

    /// Delete a task. `false` when the id is unknown.
    pub async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        let url = self.url(&format!("/tasks/{id}"));
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .context(format!("DELETE {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        checked(response, &url).await?;
        Ok(true)
    }
}

/// Pass successful responses through; otherwise fail with the server's
/// `{"error": ...}` message when it sent one.
async fn checked(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("error")?.as_str().map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    anyhow::bail!("{url} returned {status}: {message}")
}

#[async_trait]
impl QueueClient for HttpQueue {
    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.get_optional("/tasks").await?.unwrap_or_default())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        self.get_optional(&format!("/tasks/{id}")).await
    }

    async fn next_pending(&self) -> Result<Option<Task>> {
        self.get_optional("/tasks/next").await
    }

    async fn update_task(&self, id: &TaskId, update: TaskUpdate) -> Result<Option<Task>> {
        let url = self.url(&format!("/tasks/{id}"));
        let response = self
            .client
            .patch(&url)
            .json(&update)
            .send()
            .await
            .context(format!("PATCH {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .context(format!("PATCH {url}"))?;
        Ok(Some(response.json().await.context("invalid task in response")?))
    }

    async fn post_activity(&self, id: &TaskId, entry: ActivityEntry) -> Result<()> {
        let url = self.url(&format!("/tasks/{id}/activity"));
        self.client
            .post(&url)
            .json(&entry)
            .send()
            .await
            .context(format!("POST {url}"))?
            .error_for_status()
            .context(format!("POST {url}"))?;
        Ok(())
    }
}

/// Server-sent event subscription to `GET /api/v1/events/stream`.
#[derive(Clone)]
pub struct HttpEvents {
    client: reqwest::Client,
    server: String,
}

impl HttpEvents {
    pub fn new(server: impl Into<String>) -> Result<Self> {
        // No overall timeout: the stream stays open indefinitely.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            server: server.into(),
        })
    }
}

#[async_trait]
impl EventSource for HttpEvents {
    async fn connect(&self) -> Result<EventStream> {
        let url = api_url(&self.server, "/events/stream");
        let response = self
            .client
            .get(&url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .context(format!("failed to connect to {url}"))?
            .error_for_status()
            .context(format!("event stream rejected by {url}"))?;
        tracing::debug!(%url, "event stream connected");
        Ok(Box::pin(queue_events(response.bytes_stream())))
    }
}

/// One dispatched SSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            return Some(SseFrame {
                event: self.event.take(),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

struct DecodeState<S> {
    inner: std::pin::Pin<Box<S>>,
    parser: SseParser,
    pending: VecDeque<QueueEvent>,
    finished: bool,
}

/// Turn an SSE byte stream into queue events. The stream ends on transport
/// error, server close, or a lag notice.
fn queue_events<S, B>(bytes: S) -> impl Stream<Item = QueueEvent> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    let state = DecodeState {
        inner: Box::pin(bytes),
        parser: SseParser::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.parser.push(chunk.as_ref()) {
                        if frame.event.as_deref() == Some(LAGGED_EVENT) {
                            tracing::warn!(data = %frame.data, "server reports lagged subscription");
                            state.finished = true;
                            break;
                        }
                        match serde_json::from_str::<QueueEvent>(&frame.data) {
                            Ok(event) => state.pending.push_back(event),
                            Err(e) => {
                                tracing::debug!(error = %e, "ignoring unrecognized event")
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "event stream error");
                    state.finished = true;
                }
                None => {
                    tracing::debug!("event stream closed by server");
                    state.finished = true;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_event_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"event: task_dele").is_empty());
        assert!(parser.push(b"ted\ndata: {\"type\":\"task_deleted\",").is_empty());
        let frames = parser.push(b"\"id\":\"a\"}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("task_deleted".into()),
                data: r#"{"type":"task_deleted","id":"a"}"#.into(),
            }]
        );
    }

    #[test]
    fn ignores_comments_and_joins_data_lines() {
        let mut parser = SseParser::default();
        let frames = parser.push(b": keep-alive\n\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "a\nb");
        assert!(frames[0].event.is_none());
    }

    #[test]
    fn multibyte_split_is_preserved() {
        let mut parser = SseParser::default();
        let text = "data: héllo\n\n".as_bytes();
        let (a, b) = text.split_at(8);
        assert!(parser.push(a).is_empty());
        assert_eq!(parser.push(b)[0].data, "héllo");
    }

    #[tokio::test]
    async fn decodes_queue_events_until_lag() {
        let chunks: Vec<Result<Vec<u8>, reqwest::Error>> = vec![
            Ok(b"event: task_cancel\ndata: {\"type\":\"task_cancel\",\"id\":\"x\"}\n\n".to_vec()),
            Ok(b"data: not json\n\n".to_vec()),
            Ok(b"event: lagged\ndata: {\"skipped\":3}\n\n".to_vec()),
            Ok(b"data: {\"type\":\"task_deleted\",\"id\":\"y\"}\n\n".to_vec()),
        ];
        let events: Vec<_> = queue_events(futures_util::stream::iter(chunks))
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id().as_str(), "x");
    }

    #[test]
    fn api_url_trims_trailing_slash() {
        assert_eq!(
            api_url("http://127.0.0.1:3847/", "/tasks/next"),
            "http://127.0.0.1:3847/api/v1/tasks/next"
        );
    }
}
