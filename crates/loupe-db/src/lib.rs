//! Durable storage for the task queue: one JSON document plus the screenshot
//! files it points at.

pub mod artifact_store;
pub mod queue_store;

pub use artifact_store::{Artifact, ArtifactStore};
pub use queue_store::{DocumentSource, Loaded, QueueDocument, QueueStore};
