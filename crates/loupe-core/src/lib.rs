//! Core types for loupe: annotated UI tasks, queue events, the agent prompt
//! builder, configuration and telemetry.

pub mod config;
pub mod error;
pub mod event;
pub mod prompt;
pub mod task;
pub mod telemetry;
