//! Structured log lines for workflow lifecycle events.
//!
//! Subscribes to an engine's [`EventBus`] and turns every [`WorkflowEvent`]
//! into a `tracing` event under the `sagaflow::events` target. Failures log
//! at `warn`/`error`, progress at `info`, per-attempt chatter at `debug`.

use sagaflow_core::event::EventBus;
use sagaflow_types::event::WorkflowEvent;
use sagaflow_types::workflow::ExecutionStatus;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Level;

/// Subscribe to `bus` and log events until every sender is dropped.
///
/// The subscription is taken before this returns, so no event published
/// afterwards is missed.
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        target: "sagaflow::events",
                        skipped = n,
                        "event logger lagged, skipping {n} events"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Level an event is logged at.
pub fn event_level(event: &WorkflowEvent) -> Level {
    match event {
        WorkflowEvent::StepStarted { .. } => Level::DEBUG,
        WorkflowEvent::StepFailed { will_retry: true, .. } => Level::WARN,
        WorkflowEvent::StepFailed { .. } => Level::ERROR,
        WorkflowEvent::StepCompensated { error: Some(_), .. } => Level::WARN,
        WorkflowEvent::ExecutionFinished {
            status: ExecutionStatus::Failed,
            ..
        } => Level::ERROR,
        _ => Level::INFO,
    }
}

fn log_event(event: &WorkflowEvent) {
    let execution_id = event.execution_id();
    match event {
        WorkflowEvent::ExecutionStarted {
            workflow_name,
            steps,
            ..
        } => {
            tracing::info!(target: "sagaflow::events", %execution_id, workflow = %workflow_name, steps, "execution started");
        }
        WorkflowEvent::StepStarted {
            step_name, attempt, ..
        } => {
            tracing::debug!(target: "sagaflow::events", %execution_id, step = %step_name, attempt, "step attempt started");
        }
        WorkflowEvent::StepCompleted {
            step_name,
            attempts,
            duration_ms,
            ..
        } => {
            tracing::info!(target: "sagaflow::events", %execution_id, step = %step_name, attempts, duration_ms, "step completed");
        }
        WorkflowEvent::StepFailed {
            step_name,
            attempt,
            error,
            will_retry,
            ..
        } => {
            if *will_retry {
                tracing::warn!(target: "sagaflow::events", %execution_id, step = %step_name, attempt, %error, "step attempt failed, retrying");
            } else {
                tracing::error!(target: "sagaflow::events", %execution_id, step = %step_name, attempt, %error, "step failed");
            }
        }
        WorkflowEvent::StepCompensated {
            step_name, error, ..
        } => match error {
            Some(error) => {
                tracing::warn!(target: "sagaflow::events", %execution_id, step = %step_name, %error, "compensation failed");
            }
            None => {
                tracing::info!(target: "sagaflow::events", %execution_id, step = %step_name, "step compensated");
            }
        },
        WorkflowEvent::ExecutionPaused { .. } => {
            tracing::info!(target: "sagaflow::events", %execution_id, "execution paused");
        }
        WorkflowEvent::ExecutionResumed { .. } => {
            tracing::info!(target: "sagaflow::events", %execution_id, "execution resumed");
        }
        WorkflowEvent::ExecutionFinished {
            workflow_name,
            status,
            duration_ms,
            error,
            ..
        } => {
            if *status == ExecutionStatus::Failed {
                tracing::error!(target: "sagaflow::events", %execution_id, workflow = %workflow_name, %status, duration_ms, error = error.as_deref(), "execution finished");
            } else {
                tracing::info!(target: "sagaflow::events", %execution_id, workflow = %workflow_name, %status, duration_ms, "execution finished");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn failed_attempt(will_retry: bool) -> WorkflowEvent {
        WorkflowEvent::StepFailed {
            execution_id: Uuid::now_v7(),
            step_name: "charge".to_string(),
            attempt: 1,
            error: "declined".to_string(),
            will_retry,
        }
    }

    #[test]
    fn failures_log_above_info() {
        assert_eq!(event_level(&failed_attempt(true)), Level::WARN);
        assert_eq!(event_level(&failed_attempt(false)), Level::ERROR);

        let finished = |status| WorkflowEvent::ExecutionFinished {
            execution_id: Uuid::now_v7(),
            workflow_name: "order".to_string(),
            status,
            duration_ms: 5,
            error: None,
        };
        assert_eq!(event_level(&finished(ExecutionStatus::Failed)), Level::ERROR);
        assert_eq!(event_level(&finished(ExecutionStatus::Completed)), Level::INFO);
        assert_eq!(event_level(&finished(ExecutionStatus::Cancelled)), Level::INFO);
    }

    #[test]
    fn attempt_starts_are_debug() {
        let event = WorkflowEvent::StepStarted {
            execution_id: Uuid::now_v7(),
            step_name: "reserve".to_string(),
            attempt: 1,
        };
        assert_eq!(event_level(&event), Level::DEBUG);
    }

    #[tokio::test]
    async fn logger_drains_events_and_exits_when_bus_closes() {
        let bus = EventBus::new(8);
        let handle = spawn_event_logger(&bus);
        let execution_id = Uuid::now_v7();

        bus.publish(WorkflowEvent::ExecutionPaused { execution_id });
        bus.publish(failed_attempt(false));
        bus.publish(WorkflowEvent::StepCompensated {
            execution_id,
            step_name: "reserve".to_string(),
            error: Some("already released".to_string()),
        });
        drop(bus);

        handle.await.unwrap();
    }
}
