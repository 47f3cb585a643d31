//! Workflow execution types: status state machine, execution records,
//! persistence snapshots, and per-workflow statistics.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow execution.
///
/// ```text
/// Pending -> Running -> {Completed, Failed, Cancelled}
/// Running <-> Paused
/// Pending -> Cancelled, Paused -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this status is final (never left once entered).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    /// Lowercase wire name (matches the serde representation).
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Workflow execution (engine-tracked record)
// ---------------------------------------------------------------------------

/// Engine-tracked record of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Workflow instance ID. Fresh for every execution, assigned when the
    /// engine registers it.
    pub workflow_id: Uuid,
    /// Execution ID (caller-supplied or UUIDv7).
    pub execution_id: Uuid,
    /// Name of the workflow definition being executed.
    pub workflow_name: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// When the execution was registered.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal error message, if the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal warnings (compensation failures, persistence errors).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Execution snapshot (persistence payload)
// ---------------------------------------------------------------------------

/// Point-in-time snapshot handed to the persistence collaborator after every
/// status transition. Writes are idempotent overwrites keyed by
/// `execution_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    /// When this snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// When the execution was registered.
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Step outputs keyed by step name, in completion order.
    #[serde(default)]
    pub state: Map<String, Value>,
    /// Free-form execution metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ExecutionSnapshot {
    /// Reduce the snapshot to the execution record it describes.
    pub fn to_execution(&self) -> WorkflowExecution {
        WorkflowExecution {
            workflow_id: self.workflow_id,
            execution_id: self.execution_id,
            workflow_name: self.workflow_name.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
            warnings: self.warnings.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow statistics
// ---------------------------------------------------------------------------

/// Aggregated execution statistics for one workflow name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub workflow_name: String,
    /// Executions started.
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Started but not yet finished.
    pub in_flight: u64,
    /// Running mean duration of finished executions, in milliseconds.
    pub avg_duration_ms: f64,
    /// `succeeded / (succeeded + failed)`, 0 with no completions.
    pub success_rate: f64,
}
