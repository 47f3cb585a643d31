//! Saga compensation: best-effort rollback of completed steps.
//!
//! Walks the definition in reverse declaration order and calls the
//! compensation handler of every step that both declared one and recorded an
//! output in `context.state`. Failures are collected, never propagated.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use sagaflow_types::event::WorkflowEvent;
use serde::{Deserialize, Serialize};

use super::context::WorkflowContext;
use super::definition::WorkflowDefinition;
use super::step_executor::{StepError, panic_message};
use crate::event::EventBus;

/// A compensation handler that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("compensation for step '{step_name}' failed: {error}")]
pub struct CompensationFailure {
    pub step_name: String,
    pub error: String,
}

/// Outcome of a compensation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationReport {
    /// Steps whose compensation ran successfully, in the order they ran.
    pub compensated: Vec<String>,
    pub failures: Vec<CompensationFailure>,
}

impl CompensationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures rendered as warning strings for the execution record.
    pub fn warnings(&self) -> Vec<String> {
        self.failures.iter().map(ToString::to_string).collect()
    }
}

/// Runs compensation sweeps and reports them on the event bus.
#[derive(Debug, Clone, Default)]
pub struct SagaCompensator {
    events: EventBus,
}

impl SagaCompensator {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    /// Compensate every completed step of `definition` in reverse order.
    pub async fn compensate(
        &self,
        definition: &WorkflowDefinition,
        ctx: &WorkflowContext,
    ) -> CompensationReport {
        let mut report = CompensationReport::default();

        for step in definition.steps().iter().rev() {
            let Some(handler) = step.compensation() else {
                continue;
            };
            let Some(output) = ctx.state.get(step.name()).cloned() else {
                continue;
            };

            tracing::info!(
                execution_id = %ctx.execution_id,
                step = step.name(),
                "running compensation"
            );

            let outcome = AssertUnwindSafe(handler(ctx.clone(), output))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(StepError::Panicked(panic_message(payload.as_ref())))
                });

            match outcome {
                Ok(()) => {
                    report.compensated.push(step.name().to_string());
                    self.events.publish(WorkflowEvent::StepCompensated {
                        execution_id: ctx.execution_id,
                        step_name: step.name().to_string(),
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::error!(
                        execution_id = %ctx.execution_id,
                        step = step.name(),
                        error = %e,
                        "compensation failed, continuing rollback"
                    );
                    self.events.publish(WorkflowEvent::StepCompensated {
                        execution_id: ctx.execution_id,
                        step_name: step.name().to_string(),
                        error: Some(e.to_string()),
                    });
                    report.failures.push(CompensationFailure {
                        step_name: step.name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::{Step, WorkflowBuilder};
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    type Log = Arc<Mutex<Vec<String>>>;

    fn compensating(name: &'static str, log: Log, fail: bool) -> Step {
        Step::new(name, |_ctx| async { Ok(json!(null)) }).with_compensation(
            move |_ctx, output: Value| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(format!("{name}:{output}"));
                    if fail {
                        Err(StepError::failed("undo refused"))
                    } else {
                        Ok(())
                    }
                }
            },
        )
    }

    fn ctx_with(outputs: &[(&str, Value)]) -> WorkflowContext {
        let mut ctx = WorkflowContext::new(Uuid::now_v7(), Uuid::now_v7(), "wf", json!({}));
        for (name, value) in outputs {
            ctx.record_output(name, value.clone());
        }
        ctx
    }

    #[tokio::test]
    async fn test_reverse_order_over_completed_steps_only() {
        let log: Log = Arc::default();
        let def = WorkflowBuilder::new("wf")
            .step(compensating("a", log.clone(), false))
            .step(compensating("b", log.clone(), false))
            .step(compensating("c", log.clone(), false))
            .build()
            .unwrap();
        let ctx = ctx_with(&[("a", json!(1)), ("b", json!(2))]);

        let report = SagaCompensator::default().compensate(&def, &ctx).await;

        assert_eq!(*log.lock().unwrap(), vec!["b:2", "a:1"]);
        assert_eq!(report.compensated, vec!["b", "a"]);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_steps_without_handler_are_skipped() {
        let log: Log = Arc::default();
        let def = WorkflowBuilder::new("wf")
            .step(compensating("a", log.clone(), false))
            .step(Step::new("plain", |_ctx| async { Ok(json!(null)) }))
            .build()
            .unwrap();
        let ctx = ctx_with(&[("a", json!("x")), ("plain", json!("y"))]);

        let report = SagaCompensator::default().compensate(&def, &ctx).await;

        assert_eq!(report.compensated, vec!["a"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_sweep() {
        let log: Log = Arc::default();
        let def = WorkflowBuilder::new("wf")
            .step(compensating("a", log.clone(), false))
            .step(compensating("b", log.clone(), true))
            .build()
            .unwrap();
        let ctx = ctx_with(&[("a", json!(1)), ("b", json!(2))]);

        let report = SagaCompensator::default().compensate(&def, &ctx).await;

        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(report.compensated, vec!["a"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step_name, "b");
        assert!(report.warnings()[0].contains("undo refused"));
    }

    #[tokio::test]
    async fn test_panicking_compensation_is_collected() {
        let def = WorkflowBuilder::new("wf")
            .step(
                Step::new("a", |_ctx| async { Ok(json!(null)) }).with_compensation(
                    |_ctx, _out| async {
                        if true {
                            panic!("undo exploded");
                        }
                        Ok(())
                    },
                ),
            )
            .build()
            .unwrap();
        let ctx = ctx_with(&[("a", json!(null))]);

        let report = SagaCompensator::default().compensate(&def, &ctx).await;

        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("undo exploded"));
    }

    #[tokio::test]
    async fn test_state_is_left_untouched() {
        let log: Log = Arc::default();
        let def = WorkflowBuilder::new("wf")
            .step(compensating("a", log, false))
            .build()
            .unwrap();
        let ctx = ctx_with(&[("a", json!(1))]);

        SagaCompensator::default().compensate(&def, &ctx).await;

        assert_eq!(ctx.output("a"), Some(&json!(1)));
    }
}
