//! Executes a single step with retries, backoff, and per-attempt timeouts.
//!
//! Every attempt gets a fresh clone of the context, so a failed attempt never
//! leaks partial writes. The output of the successful attempt is recorded into
//! `context.state` exactly once, before `execute` returns.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use sagaflow_types::config::EngineConfig;
use sagaflow_types::event::WorkflowEvent;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use super::context::{BridgeError, WorkflowContext};
use super::definition::Step;
use super::retry::RetryPolicy;
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a single step attempt (or compensation call).
#[derive(Debug, Error)]
pub enum StepError {
    /// The handler reported a failure.
    #[error("step execution failed: {0}")]
    ExecutionFailed(String),

    /// The attempt did not finish within the step timeout.
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// A service call made from inside the handler failed.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl StepError {
    /// Shorthand for [`StepError::ExecutionFailed`].
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::ExecutionFailed(message.into())
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        StepError::ExecutionFailed(format!("{err:#}"))
    }
}

/// A step exhausted its retry budget.
#[derive(Debug, Error)]
#[error("step '{step_name}' failed after {attempts} attempt(s): {last_error}")]
pub struct StepFailure {
    pub step_name: String,
    pub attempts: u32,
    #[source]
    pub last_error: StepError,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Runs steps according to their retry and timeout settings.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    config: EngineConfig,
    events: EventBus,
}

impl StepExecutor {
    pub fn new(config: EngineConfig, events: EventBus) -> Self {
        Self { config, events }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Timeout applied to each attempt of `step`, if any.
    fn attempt_timeout(&self, step: &Step) -> Option<Duration> {
        step.timeout()
            .or_else(|| self.config.default_step_timeout_secs.map(Duration::from_secs))
    }

    /// Execute `step`, retrying failed attempts with exponential backoff.
    ///
    /// On success the output is written to `ctx.state[step.name]` and also
    /// returned. On exhaustion the last attempt's error is returned inside a
    /// [`StepFailure`].
    #[tracing::instrument(
        name = "step",
        skip_all,
        fields(execution_id = %ctx.execution_id, step = step.name())
    )]
    pub async fn execute(
        &self,
        step: &Step,
        ctx: &mut WorkflowContext,
    ) -> Result<Value, StepFailure> {
        let policy = RetryPolicy::for_step(step, &self.config);
        let timeout = self.attempt_timeout(step);
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.events.publish(WorkflowEvent::StepStarted {
                execution_id: ctx.execution_id,
                step_name: step.name().to_string(),
                attempt,
            });

            match self.run_attempt(step, ctx, timeout).await {
                Ok(output) => {
                    ctx.record_output(step.name(), output.clone());
                    let duration_ms = started.elapsed().as_millis() as u64;
                    tracing::debug!(attempt, duration_ms, "step completed");
                    self.events.publish(WorkflowEvent::StepCompleted {
                        execution_id: ctx.execution_id,
                        step_name: step.name().to_string(),
                        attempts: attempt,
                        duration_ms,
                    });
                    return Ok(output);
                }
                Err(error) => {
                    let will_retry = policy.should_retry(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        will_retry,
                        error = %error,
                        "step attempt failed"
                    );
                    self.events.publish(WorkflowEvent::StepFailed {
                        execution_id: ctx.execution_id,
                        step_name: step.name().to_string(),
                        attempt,
                        error: error.to_string(),
                        will_retry,
                    });

                    if !will_retry {
                        return Err(StepFailure {
                            step_name: step.name().to_string(),
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        step: &Step,
        ctx: &WorkflowContext,
        timeout: Option<Duration>,
    ) -> Result<Value, StepError> {
        let fut = AssertUnwindSafe((step.handler())(ctx.clone())).catch_unwind();

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(StepError::TimedOut(limit)),
            },
            None => fut.await,
        };

        match outcome {
            Ok(result) => result,
            Err(payload) => Err(StepError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn ctx() -> WorkflowContext {
        WorkflowContext::new(Uuid::now_v7(), Uuid::now_v7(), "wf", json!({}))
    }

    fn executor() -> StepExecutor {
        let config = EngineConfig {
            backoff_base_ms: 10,
            backoff_max_ms: 50,
            ..EngineConfig::default()
        };
        StepExecutor::new(config, EventBus::new(64))
    }

    /// Step that fails `failures` times before succeeding.
    fn flaky(name: &str, failures: u32, calls: Arc<AtomicU32>) -> Step {
        Step::new(name, move |_ctx| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(StepError::failed(format!("boom {n}")))
                } else {
                    Ok(json!({"call": n}))
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_records_output_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = flaky("a", 0, calls.clone());
        let mut ctx = ctx();

        let out = executor().execute(&step, &mut ctx).await.unwrap();

        assert_eq!(out, json!({"call": 1}));
        assert_eq!(ctx.state.len(), 1);
        assert_eq!(ctx.output("a"), Some(&json!({"call": 1})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_sees_a_snapshot_of_the_context() {
        let step = Step::new("scribble", |mut ctx: WorkflowContext| async move {
            ctx.metadata.insert("scribbled".to_string(), json!(true));
            ctx.state.insert("other".to_string(), json!("stray"));
            Ok(json!("done"))
        });
        let mut ctx = ctx();

        executor().execute(&step, &mut ctx).await.unwrap();

        assert!(ctx.metadata.get("scribbled").is_none());
        let keys: Vec<&String> = ctx.state.keys().collect();
        assert_eq!(keys, vec!["scribble"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = flaky("a", 2, calls.clone()).with_retry_count(3);
        let mut ctx = ctx();

        let out = executor().execute(&step, &mut ctx).await.unwrap();

        assert_eq!(out, json!({"call": 3}));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = flaky("a", u32::MAX, calls.clone()).with_retry_count(3);
        let mut ctx = ctx();

        let failure = executor().execute(&step, &mut ctx).await.unwrap_err();

        assert_eq!(failure.step_name, "a");
        assert_eq!(failure.attempts, 3);
        assert!(failure.last_error.to_string().contains("boom 3"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(ctx.state.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_never_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = flaky("a", u32::MAX, calls.clone()).with_retry_count(1);

        let failure = executor().execute(&step, &mut ctx()).await.unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = flaky("a", 2, calls.clone()).with_retry_count(3);
        let before = Instant::now();

        executor().execute(&step, &mut ctx()).await.unwrap();

        // 10ms after attempt 1, 20ms after attempt 2.
        assert!(before.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let step = Step::new("slow", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            }
        })
        .with_retry_count(2)
        .with_timeout(Duration::from_millis(100));

        let failure = executor().execute(&step, &mut ctx()).await.unwrap_err();

        assert_eq!(failure.attempts, 2);
        assert!(matches!(failure.last_error, StepError::TimedOut(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_is_a_failed_attempt() {
        let step = Step::new("explode", |_ctx| async {
            if true {
                panic!("kaboom");
            }
            Ok(json!(null))
        })
        .with_retry_count(1);

        let failure = executor().execute(&step, &mut ctx()).await.unwrap_err();

        match failure.last_error {
            StepError::Panicked(msg) => assert!(msg.contains("kaboom")),
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_step_events() {
        let exec = executor();
        let mut rx = exec.events.subscribe();
        let calls = Arc::new(AtomicU32::new(0));
        let step = flaky("a", 1, calls).with_retry_count(2);

        exec.execute(&step, &mut ctx()).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                WorkflowEvent::StepStarted { attempt, .. } => format!("started:{attempt}"),
                WorkflowEvent::StepFailed { will_retry, .. } => format!("failed:{will_retry}"),
                WorkflowEvent::StepCompleted { attempts, .. } => format!("completed:{attempts}"),
                other => format!("{other:?}"),
            });
        }
        assert_eq!(
            kinds,
            vec!["started:1", "failed:true", "started:2", "completed:2"]
        );
    }

    #[test]
    fn test_anyhow_converts_to_step_error() {
        let err: StepError = anyhow::anyhow!("disk full").context("writing receipt").into();
        assert!(err.to_string().contains("writing receipt: disk full"));
    }
}
