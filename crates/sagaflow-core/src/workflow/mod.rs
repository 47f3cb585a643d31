//! Workflow engine core: definitions, step execution, saga compensation,
//! lifecycle state, scheduling, and metrics.
//!
//! - `definition` -- Step model, workflow builder and validation
//! - `context` -- Per-execution state and the service-call bridge
//! - `retry` -- Retry budget and exponential backoff policy
//! - `step_executor` -- Runs one step with retries and per-attempt timeouts
//! - `compensator` -- Best-effort reverse-order saga rollback
//! - `checkpoint` -- Snapshot persistence on top of `ExecutionRepository`
//! - `engine` -- Execution state machine and active-execution registry
//! - `metrics` -- Per-workflow counters and running average duration
//! - `scheduler` -- Interval and cron-like recurring job triggers

pub mod checkpoint;
pub mod compensator;
pub mod context;
pub mod definition;
pub mod engine;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod step_executor;

pub use checkpoint::{CheckpointError, CheckpointManager};
pub use compensator::{CompensationFailure, CompensationReport, SagaCompensator};
pub use context::{BridgeError, NullServiceBridge, ServiceBridge, ServiceRequest, WorkflowContext};
pub use definition::{Step, WorkflowBuilder, WorkflowDefinition, WorkflowError};
pub use engine::{ExecutionHandle, ExecutionOptions, ExecutionResult, ExecutorError, WorkflowEngine};
pub use metrics::MetricsCollector;
pub use retry::RetryPolicy;
pub use scheduler::{
    JobError, JobHandler, Schedule, Scheduler, SchedulerError, normalize_schedule, workflow_job,
};
pub use step_executor::{StepError, StepExecutor, StepFailure};
