//! Execution repository trait definition.
//!
//! The engine hands an `ExecutionSnapshot` to this trait after every status
//! transition. Implementations must be safe for concurrent calls from many
//! executions and treat `save` as an idempotent overwrite keyed by
//! `execution_id`.

use sagaflow_types::error::RepositoryError;
use sagaflow_types::workflow::ExecutionSnapshot;
use uuid::Uuid;

/// Repository trait for execution state persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRepository: Send + Sync {
    /// Upsert the snapshot for `snapshot.execution_id`.
    fn save(
        &self,
        snapshot: &ExecutionSnapshot,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get the latest snapshot for an execution.
    fn get(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionSnapshot>, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------
