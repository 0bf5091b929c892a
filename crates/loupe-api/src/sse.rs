//! Server-Sent Events (SSE) endpoint for live queue notifications.
//!
//! Subscribes to the broadcast `EventBus` and emits each `QueueEvent` as a
//! JSON-encoded SSE event named after the event type. The dispatcher (when
//! running out of process) and the review UI connect via
//! `GET /api/v1/events/stream`.
//!
//! SSE event format:
//! ```text
//! event: task_updated
//! data: {"type":"task_updated","task":{...}}
//!
//! ```

use axum::{
    extract::State,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::ApiState;

/// GET /api/v1/events/stream
///
/// Keep-alive comments are sent periodically. A client that falls behind
/// gets a `lagged` event and should resynchronize from `GET /tasks`. The
/// stream ends when the server shuts down.
pub async fn event_stream(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let rx = state.queue.bus().subscribe();
    tracing::debug!(
        subscribers = state.queue.bus().subscriber_count(),
        "SSE client connected"
    );
    let stream = BroadcastStream::new(rx);

    let sse_stream = stream.filter_map(|result| match result {
        Ok(event) => {
            let json = serde_json::to_string(&event).ok()?;
            Some(Ok::<_, Infallible>(
                Event::default().event(event.name()).data(json),
            ))
        }
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            tracing::debug!(skipped = n, "SSE client lagged, skipping events");
            Some(Ok(Event::default()
                .event("lagged")
                .data(format!("{{\"skipped\":{n}}}"))))
        }
    });

    let sse_stream = futures_util::StreamExt::take_until(
        sse_stream,
        state.closing.clone().cancelled_owned(),
    );

    Sse::new(sse_stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use loupe_core::event::QueueEvent;
    use loupe_core::task::TaskId;
    use tower::ServiceExt;

    #[tokio::test]
    async fn sse_endpoint_streams_named_events() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(ApiState::open(dir.path()).unwrap());
        let bus = state.queue.bus().clone();
        let app = crate::api_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/events/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let ct = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(ct.contains("text/event-stream"), "content-type was: {ct}");

        // Subscribed when the handler ran, so this is delivered
        bus.emit(QueueEvent::TaskCancel {
            id: TaskId::from("abc"),
        });

        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("event: task_cancel"), "got: {text}");
        assert!(text.contains(r#""id":"abc""#), "got: {text}");
    }
}
