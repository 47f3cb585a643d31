//! In-memory execution metrics per workflow name.
//!
//! Durations are measured with the injected [`Clock`] and folded into a
//! running mean, so no per-execution history is retained.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sagaflow_types::workflow::{ExecutionStatus, WorkflowStats};
use uuid::Uuid;

use crate::clock::Clock;

#[derive(Debug, Default, Clone)]
struct Counters {
    total: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    in_flight: u64,
    finished: u64,
    avg_duration_ms: f64,
}

impl Counters {
    fn to_stats(&self, workflow_name: &str) -> WorkflowStats {
        let decided = self.succeeded + self.failed;
        let success_rate = if decided == 0 {
            0.0
        } else {
            self.succeeded as f64 / decided as f64
        };
        WorkflowStats {
            workflow_name: workflow_name.to_string(),
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            cancelled: self.cancelled,
            in_flight: self.in_flight,
            avg_duration_ms: self.avg_duration_ms,
            success_rate,
        }
    }
}

/// Thread-safe metrics collector shared by the engine and its callers.
pub struct MetricsCollector {
    clock: Arc<dyn Clock>,
    workflows: DashMap<String, Counters>,
    running: DashMap<Uuid, (String, DateTime<Utc>)>,
}

impl MetricsCollector {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            workflows: DashMap::new(),
            running: DashMap::new(),
        }
    }

    /// Count a new execution of `workflow_name` as started now.
    pub fn record_start(&self, workflow_name: &str, execution_id: Uuid) {
        let started_at = self.clock.now();
        if self
            .running
            .insert(execution_id, (workflow_name.to_string(), started_at))
            .is_some()
        {
            tracing::warn!(%execution_id, "execution start recorded twice");
            return;
        }

        let mut counters = self.workflows.entry(workflow_name.to_string()).or_default();
        counters.total += 1;
        counters.in_flight += 1;
    }

    /// Record the terminal outcome of a started execution.
    ///
    /// Unknown execution ids and non-terminal statuses are ignored.
    pub fn record_complete(&self, execution_id: Uuid, status: ExecutionStatus, error: Option<&str>) {
        if !status.is_terminal() {
            tracing::warn!(%execution_id, %status, "ignoring non-terminal completion");
            return;
        }
        let Some((_, (workflow_name, started_at))) = self.running.remove(&execution_id) else {
            tracing::debug!(%execution_id, "completion for untracked execution");
            return;
        };

        let duration_ms = (self.clock.now() - started_at).num_milliseconds().max(0) as f64;

        let mut counters = self.workflows.entry(workflow_name.clone()).or_default();
        counters.in_flight = counters.in_flight.saturating_sub(1);
        match status {
            ExecutionStatus::Completed => counters.succeeded += 1,
            ExecutionStatus::Failed => counters.failed += 1,
            _ => counters.cancelled += 1,
        }
        counters.finished += 1;
        counters.avg_duration_ms += (duration_ms - counters.avg_duration_ms) / counters.finished as f64;

        tracing::debug!(
            %execution_id,
            workflow = %workflow_name,
            %status,
            duration_ms,
            error,
            "execution metrics recorded"
        );
    }

    /// Statistics for one workflow, if it ever started.
    pub fn get_stats(&self, workflow_name: &str) -> Option<WorkflowStats> {
        self.workflows
            .get(workflow_name)
            .map(|c| c.to_stats(workflow_name))
    }

    /// Statistics for every workflow, sorted by name.
    pub fn all_stats(&self) -> Vec<WorkflowStats> {
        let mut stats: Vec<WorkflowStats> = self
            .workflows
            .iter()
            .map(|entry| entry.value().to_stats(entry.key()))
            .collect();
        stats.sort_by(|a, b| a.workflow_name.cmp(&b.workflow_name));
        stats
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("workflows", &self.workflows.len())
            .field("running", &self.running.len())
            .finish()
    }
}
