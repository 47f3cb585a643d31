//! Checkpoint manager for workflow execution snapshots.
//!
//! Wraps `ExecutionRepository` with a higher-level API. The engine records a
//! snapshot after every status transition and, when enabled, after every
//! successful step so that a restored snapshot reflects the last completed
//! step.

use sagaflow_types::workflow::ExecutionSnapshot;
use uuid::Uuid;

use crate::repository::execution::ExecutionRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists execution snapshots through any `ExecutionRepository`.
pub struct CheckpointManager<R: ExecutionRepository> {
    repo: R,
}

impl<R: ExecutionRepository> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given repository.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Record `snapshot`, overwriting any earlier snapshot of the execution.
    pub async fn checkpoint(&self, snapshot: &ExecutionSnapshot) -> Result<(), CheckpointError> {
        self.repo
            .save(snapshot)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %snapshot.execution_id,
            status = %snapshot.status,
            steps_recorded = snapshot.state.len(),
            "checkpointed execution"
        );
        Ok(())
    }

    /// Latest snapshot of an execution, if one was ever saved.
    pub async fn latest(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionSnapshot>, CheckpointError> {
        self.repo
            .get(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Load the latest snapshot, failing if none exists.
    pub async fn restore(&self, execution_id: Uuid) -> Result<ExecutionSnapshot, CheckpointError> {
        self.latest(execution_id)
            .await?
            .ok_or(CheckpointError::ExecutionNotFound(execution_id))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// No snapshot stored for the execution.
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
