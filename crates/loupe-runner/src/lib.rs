//! Runtime side of loupe: the event bus, the in-process queue service, the
//! agent launcher and the dispatch loop that ties them together.

pub mod backoff;
pub mod claude;
pub mod client;
pub mod dispatch;
pub mod event_bus;
pub mod http;
pub mod launcher;
pub mod queue;
pub mod subprocess;

pub use client::{EventSource, EventStream, QueueClient};
pub use dispatch::{DispatchOutcome, Dispatcher, Reconciled};
pub use event_bus::EventBus;
pub use launcher::{ActivitySink, AgentLauncher};
pub use queue::{ActivityOutcome, CancelOutcome, LocalEvents, LocalQueue};
