//! Event types for the Sagaflow workflow event bus.
//!
//! `WorkflowEvent` is broadcast by the engine during execution. All variants
//! are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::ExecutionStatus;

/// Lifecycle events emitted while a workflow executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// An execution moved to `Running` for the first time.
    ExecutionStarted {
        execution_id: Uuid,
        workflow_name: String,
        steps: usize,
    },

    /// A step attempt is about to run.
    StepStarted {
        execution_id: Uuid,
        step_name: String,
        attempt: u32,
    },

    /// A step completed successfully and its output was recorded.
    StepCompleted {
        execution_id: Uuid,
        step_name: String,
        attempts: u32,
        duration_ms: u64,
    },

    /// A step attempt failed.
    StepFailed {
        execution_id: Uuid,
        step_name: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },

    /// A compensation handler ran, successfully or not.
    StepCompensated {
        execution_id: Uuid,
        step_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The execution was paused before its next step.
    ExecutionPaused { execution_id: Uuid },

    /// A paused execution was resumed.
    ExecutionResumed { execution_id: Uuid },

    /// The execution reached a terminal status.
    ExecutionFinished {
        execution_id: Uuid,
        workflow_name: String,
        status: ExecutionStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WorkflowEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::ExecutionStarted { execution_id, .. }
            | WorkflowEvent::StepStarted { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::StepFailed { execution_id, .. }
            | WorkflowEvent::StepCompensated { execution_id, .. }
            | WorkflowEvent::ExecutionPaused { execution_id }
            | WorkflowEvent::ExecutionResumed { execution_id }
            | WorkflowEvent::ExecutionFinished { execution_id, .. } => *execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagged_serialization() {
        let event = WorkflowEvent::StepFailed {
            execution_id: Uuid::nil(),
            step_name: "charge".to_string(),
            attempt: 2,
            error: "card declined".to_string(),
            will_retry: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_failed");
        assert_eq!(json["step_name"], "charge");
        assert_eq!(json["will_retry"], false);
    }

    #[test]
    fn test_finished_event_omits_missing_error() {
        let event = WorkflowEvent::ExecutionFinished {
            execution_id: Uuid::nil(),
            workflow_name: "order".to_string(),
            status: ExecutionStatus::Completed,
            duration_ms: 12,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "completed");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_execution_id_accessor() {
        let id = Uuid::now_v7();
        let event = WorkflowEvent::ExecutionPaused { execution_id: id };
        assert_eq!(event.execution_id(), id);
    }
}
