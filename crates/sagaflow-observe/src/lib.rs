//! Observability for Sagaflow.
//!
//! - `tracing_setup` -- Global subscriber with optional OpenTelemetry export
//! - `event_log` -- Structured log lines for engine lifecycle events

pub mod event_log;
pub mod tracing_setup;

pub use event_log::spawn_event_logger;
pub use tracing_setup::{init_tracing, shutdown_tracing};
