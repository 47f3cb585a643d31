//! In-memory execution repository.
//!
//! Implements `ExecutionRepository` from `sagaflow-core` with a `DashMap`
//! keyed by execution id. Saves overwrite, so the map always holds the
//! latest snapshot per execution. Nothing survives the process.

use std::sync::Arc;

use dashmap::DashMap;
use sagaflow_core::repository::execution::ExecutionRepository;
use sagaflow_types::error::RepositoryError;
use sagaflow_types::workflow::{ExecutionSnapshot, ExecutionStatus};
use uuid::Uuid;

/// `DashMap`-backed implementation of `ExecutionRepository`.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutionRepository {
    snapshots: Arc<DashMap<Uuid, ExecutionSnapshot>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executions stored.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Latest snapshots of every execution of `workflow_name`, oldest first.
    pub fn list_by_workflow(&self, workflow_name: &str) -> Vec<ExecutionSnapshot> {
        self.collect(|s| s.workflow_name == workflow_name)
    }

    /// Latest snapshots currently in `status`, oldest first.
    pub fn list_by_status(&self, status: ExecutionStatus) -> Vec<ExecutionSnapshot> {
        self.collect(|s| s.status == status)
    }

    fn collect(&self, keep: impl Fn(&ExecutionSnapshot) -> bool) -> Vec<ExecutionSnapshot> {
        let mut out: Vec<ExecutionSnapshot> = self
            .snapshots
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|s| (s.started_at, s.execution_id));
        out
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save(&self, snapshot: &ExecutionSnapshot) -> Result<(), RepositoryError> {
        self.snapshots
            .insert(snapshot.execution_id, snapshot.clone());
        tracing::trace!(
            execution_id = %snapshot.execution_id,
            status = %snapshot.status,
            "snapshot stored"
        );
        Ok(())
    }

    async fn get(&self, execution_id: &Uuid) -> Result<Option<ExecutionSnapshot>, RepositoryError> {
        Ok(self
            .snapshots
            .get(execution_id)
            .map(|entry| entry.value().clone()))
    }
}
