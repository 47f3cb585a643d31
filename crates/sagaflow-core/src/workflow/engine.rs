//! Workflow engine: drives executions through their lifecycle.
//!
//! State machine:
//!
//! ```text
//! Pending -> Running -> Completed | Failed | Cancelled
//! Running <-> Paused
//! Pending -> Cancelled, Paused -> Cancelled
//! ```
//!
//! Every status transition is checked against
//! [`ExecutionStatus::can_transition_to`] while holding the execution's
//! registry entry, then persisted through the [`CheckpointManager`].
//! Persistence errors never block a transition; they are recorded as
//! warnings on the execution.
//!
//! Pause and cancel are cooperative. The run loop observes them at step
//! boundaries only, so an in-flight attempt always runs to completion.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sagaflow_types::config::EngineConfig;
use sagaflow_types::event::WorkflowEvent;
use sagaflow_types::workflow::{ExecutionSnapshot, ExecutionStatus, WorkflowExecution};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::compensator::{CompensationReport, SagaCompensator};
use super::context::{ServiceBridge, WorkflowContext};
use super::definition::WorkflowDefinition;
use super::metrics::MetricsCollector;
use super::step_executor::{StepExecutor, StepFailure};
use crate::clock::{Clock, SystemClock};
use crate::event::EventBus;
use crate::repository::execution::ExecutionRepository;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A step exhausted its retries. Compensation has already run.
    #[error("execution {execution_id} failed: {failure}")]
    StepFailed {
        execution_id: Uuid,
        #[source]
        failure: StepFailure,
        compensation: CompensationReport,
    },

    #[error("execution {execution_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        execution_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {0} is already active")]
    AlreadyActive(Uuid),

    /// The execution was cancelled before it finished.
    #[error("execution {0} was cancelled")]
    Cancelled(Uuid),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The task running a spawned execution panicked or was aborted.
    #[error("execution task failed: {0}")]
    Task(String),
}

// ---------------------------------------------------------------------------
// Public result types
// ---------------------------------------------------------------------------

/// Per-execution options for [`WorkflowEngine::execute`].
#[derive(Clone, Default)]
pub struct ExecutionOptions {
    /// Use this id instead of generating one.
    pub execution_id: Option<Uuid>,
    pub metadata: HashMap<String, Value>,
    /// Overrides the engine-wide bridge for this execution.
    pub bridge: Option<Arc<dyn ServiceBridge>>,
}

impl ExecutionOptions {
    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn ServiceBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }
}

impl std::fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("execution_id", &self.execution_id)
            .field("metadata", &self.metadata)
            .field("bridge", &self.bridge.is_some())
            .finish()
    }
}

/// Final state of a completed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    /// Step outputs in declaration order.
    pub state: Map<String, Value>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Handle to an execution running on its own task.
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: Uuid,
    handle: JoinHandle<Result<ExecutionResult, ExecutorError>>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Wait for the execution to finish.
    pub async fn join(self) -> Result<ExecutionResult, ExecutorError> {
        self.handle
            .await
            .map_err(|e| ExecutorError::Task(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Registry entries
// ---------------------------------------------------------------------------

struct ExecutionControl {
    cancel: CancellationToken,
    /// `true` while paused.
    pause: watch::Sender<bool>,
    /// Serializes snapshot writes so the last save reflects the latest state.
    persist: Mutex<()>,
}

struct ActiveExecution {
    record: WorkflowExecution,
    state: Map<String, Value>,
    metadata: HashMap<String, Value>,
    control: Arc<ExecutionControl>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Runs workflow definitions and tracks their executions.
///
/// One engine instance owns its set of active executions. Share it behind an
/// `Arc` to run executions concurrently (see [`WorkflowEngine::spawn`]).
pub struct WorkflowEngine<R: ExecutionRepository> {
    checkpoints: CheckpointManager<R>,
    executor: StepExecutor,
    compensator: SagaCompensator,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: EngineConfig,
    bridge: Option<Arc<dyn ServiceBridge>>,
    active: DashMap<Uuid, ActiveExecution>,
}

impl<R: ExecutionRepository> WorkflowEngine<R> {
    /// Engine with default configuration and the system clock.
    pub fn new(repo: R) -> Self {
        Self::with_config(repo, EngineConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_config(repo: R, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let events = EventBus::default();
        Self {
            checkpoints: CheckpointManager::new(repo),
            executor: StepExecutor::new(config.clone(), events.clone()),
            compensator: SagaCompensator::new(events.clone()),
            metrics: Arc::new(MetricsCollector::new(clock.clone())),
            clock,
            events,
            config,
            bridge: None,
            active: DashMap::new(),
        }
    }

    /// Set the bridge every execution's context uses by default.
    pub fn with_bridge(mut self, bridge: Arc<dyn ServiceBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn checkpoints(&self) -> &CheckpointManager<R> {
        &self.checkpoints
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run `definition` to completion on the current task.
    ///
    /// Returns the final state on success. When a step exhausts its retries
    /// the execution moves to `Failed`, compensation runs over the completed
    /// steps, and [`ExecutorError::StepFailed`] is returned.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        inputs: Value,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, ExecutorError> {
        let execution_id = self.register(definition, &options)?;
        self.run(definition, inputs, options, execution_id).await
    }

    /// Register the execution now and run it on a new tokio task.
    ///
    /// The execution is visible as `Pending` as soon as this returns.
    pub fn spawn(
        self: &Arc<Self>,
        definition: WorkflowDefinition,
        inputs: Value,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle, ExecutorError>
    where
        R: 'static,
    {
        let execution_id = self.register(&definition, &options)?;
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.run(&definition, inputs, options, execution_id).await
        });
        Ok(ExecutionHandle {
            execution_id,
            handle,
        })
    }

    /// Insert a `Pending` entry into the active registry.
    fn register(
        &self,
        definition: &WorkflowDefinition,
        options: &ExecutionOptions,
    ) -> Result<Uuid, ExecutorError> {
        let execution_id = options.execution_id.unwrap_or_else(Uuid::now_v7);
        let workflow_id = Uuid::now_v7();
        let (pause, _) = watch::channel(false);

        match self.active.entry(execution_id) {
            Entry::Occupied(_) => Err(ExecutorError::AlreadyActive(execution_id)),
            Entry::Vacant(slot) => {
                slot.insert(ActiveExecution {
                    record: WorkflowExecution {
                        workflow_id,
                        execution_id,
                        workflow_name: definition.name().to_string(),
                        status: ExecutionStatus::Pending,
                        started_at: self.clock.now(),
                        completed_at: None,
                        error: None,
                        warnings: Vec::new(),
                    },
                    state: Map::new(),
                    metadata: options.metadata.clone(),
                    control: Arc::new(ExecutionControl {
                        cancel: CancellationToken::new(),
                        pause,
                        persist: Mutex::new(()),
                    }),
                });
                tracing::debug!(%execution_id, workflow = definition.name(), "execution registered");
                Ok(execution_id)
            }
        }
    }

    #[tracing::instrument(
        name = "workflow",
        skip_all,
        fields(workflow = definition.name(), execution_id = %execution_id)
    )]
    async fn run(
        &self,
        definition: &WorkflowDefinition,
        inputs: Value,
        options: ExecutionOptions,
        execution_id: Uuid,
    ) -> Result<ExecutionResult, ExecutorError> {
        let registered = self
            .active
            .get(&execution_id)
            .map(|entry| (entry.control.clone(), entry.record.workflow_id));
        let Some((control, workflow_id)) = registered else {
            return Err(ExecutorError::Cancelled(execution_id));
        };
        self.persist(execution_id).await;

        let mut gate = control.pause.subscribe();
        let mut ctx = WorkflowContext::new(workflow_id, execution_id, definition.name(), inputs)
            .with_metadata(options.metadata);
        if let Some(bridge) = options.bridge.or_else(|| self.bridge.clone()) {
            ctx = ctx.with_bridge(bridge);
        }

        self.start(execution_id, &control)?;
        self.persist(execution_id).await;
        self.events.publish(WorkflowEvent::ExecutionStarted {
            execution_id,
            workflow_name: definition.name().to_string(),
            steps: definition.steps().len(),
        });
        tracing::info!(steps = definition.steps().len(), "execution started");

        for step in definition.steps() {
            self.wait_at_boundary(execution_id, &control, &mut gate).await?;

            if let Err(failure) = self.executor.execute(step, &mut ctx).await {
                return self
                    .fail(definition, &ctx, execution_id, &control, &mut gate, failure)
                    .await;
            }

            if let Some(mut entry) = self.active.get_mut(&execution_id) {
                entry.state = ctx.state.clone();
            }
            if self.config.checkpoint_each_step {
                self.persist(execution_id).await;
            }
        }

        self.transition_at_boundary(execution_id, &control, &mut gate, ExecutionStatus::Completed, None)
            .await?;

        let result = self
            .finalize(execution_id)
            .await
            .ok_or(ExecutorError::Cancelled(execution_id))?;
        tracing::info!(warnings = result.warnings.len(), "execution completed");
        Ok(result)
    }

    /// Handle a step that exhausted its retries.
    async fn fail(
        &self,
        definition: &WorkflowDefinition,
        ctx: &WorkflowContext,
        execution_id: Uuid,
        control: &ExecutionControl,
        gate: &mut watch::Receiver<bool>,
        failure: StepFailure,
    ) -> Result<ExecutionResult, ExecutorError> {
        tracing::error!(
            step = %failure.step_name,
            attempts = failure.attempts,
            error = %failure.last_error,
            "step exhausted retries, failing execution"
        );

        self.transition_at_boundary(
            execution_id,
            control,
            gate,
            ExecutionStatus::Failed,
            Some(failure.to_string()),
        )
        .await?;
        self.persist(execution_id).await;

        let compensation = self.compensator.compensate(definition, ctx).await;
        if !compensation.is_clean() {
            tracing::warn!(
                failures = compensation.failures.len(),
                "compensation finished with failures"
            );
        }
        if let Some(mut entry) = self.active.get_mut(&execution_id) {
            entry.record.warnings.extend(compensation.warnings());
        }

        self.finalize(execution_id).await;
        Err(ExecutorError::StepFailed {
            execution_id,
            failure,
            compensation,
        })
    }

    /// Block while paused. Returns `Cancelled` once the token fires.
    async fn wait_at_boundary(
        &self,
        execution_id: Uuid,
        control: &ExecutionControl,
        gate: &mut watch::Receiver<bool>,
    ) -> Result<(), ExecutorError> {
        loop {
            if control.cancel.is_cancelled() {
                tracing::info!("execution cancelled at step boundary");
                return Err(ExecutorError::Cancelled(execution_id));
            }
            if !*gate.borrow_and_update() {
                return Ok(());
            }

            tracing::debug!("execution paused at step boundary");
            tokio::select! {
                _ = control.cancel.cancelled() => {}
                changed = gate.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Move to a terminal status from `Running`. A paused execution has to
    /// be resumed first; a cancel that wins the race yields `Cancelled`.
    async fn transition_at_boundary(
        &self,
        execution_id: Uuid,
        control: &ExecutionControl,
        gate: &mut watch::Receiver<bool>,
        to: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), ExecutorError> {
        loop {
            self.wait_at_boundary(execution_id, control, gate).await?;
            match self.transition(execution_id, to, error.clone()) {
                Ok(()) => return Ok(()),
                Err(ExecutorError::InvalidStateTransition {
                    from: ExecutionStatus::Paused,
                    ..
                }) => continue,
                Err(_) if control.cancel.is_cancelled() => {
                    return Err(ExecutorError::Cancelled(execution_id));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `Pending -> Running`, counting the start in metrics under the same
    /// registry lock that a concurrent `cancel` would need.
    fn start(&self, execution_id: Uuid, control: &ExecutionControl) -> Result<(), ExecutorError> {
        let Some(mut entry) = self.active.get_mut(&execution_id) else {
            return Err(ExecutorError::Cancelled(execution_id));
        };
        let from = entry.record.status;
        if !from.can_transition_to(ExecutionStatus::Running) || control.cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled(execution_id));
        }
        entry.record.status = ExecutionStatus::Running;
        self.metrics
            .record_start(&entry.record.workflow_name, execution_id);
        Ok(())
    }

    /// Apply a validated status change to an active execution.
    fn transition(
        &self,
        execution_id: Uuid,
        to: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), ExecutorError> {
        let mut entry = self
            .active
            .get_mut(&execution_id)
            .ok_or(ExecutorError::ExecutionNotFound(execution_id))?;

        let from = entry.record.status;
        if !from.can_transition_to(to) {
            return Err(ExecutorError::InvalidStateTransition {
                execution_id,
                from,
                to,
            });
        }

        entry.record.status = to;
        if to.is_terminal() {
            entry.record.completed_at = Some(self.clock.now());
            entry.record.error = error;
        }
        tracing::debug!(%execution_id, %from, %to, "status transition");
        Ok(())
    }

    /// Persist the terminal snapshot, then deregister the execution.
    async fn finalize(&self, execution_id: Uuid) -> Option<ExecutionResult> {
        self.persist(execution_id).await;

        let (_, entry) = self.active.remove(&execution_id)?;
        let record = entry.record;
        self.metrics
            .record_complete(execution_id, record.status, record.error.as_deref());
        self.events.publish(WorkflowEvent::ExecutionFinished {
            execution_id,
            workflow_name: record.workflow_name.clone(),
            status: record.status,
            duration_ms: duration_ms(record.started_at, record.completed_at),
            error: record.error.clone(),
        });

        Some(ExecutionResult {
            execution_id,
            workflow_id: record.workflow_id,
            workflow_name: record.workflow_name,
            status: record.status,
            state: entry.state,
            warnings: record.warnings,
            started_at: record.started_at,
            completed_at: record.completed_at,
        })
    }

    fn snapshot_of(&self, entry: &ActiveExecution) -> ExecutionSnapshot {
        let record = &entry.record;
        ExecutionSnapshot {
            workflow_id: record.workflow_id,
            execution_id: record.execution_id,
            workflow_name: record.workflow_name.clone(),
            status: record.status,
            timestamp: self.clock.now(),
            started_at: record.started_at,
            completed_at: record.completed_at,
            state: entry.state.clone(),
            metadata: entry.metadata.clone(),
            error: record.error.clone(),
            warnings: record.warnings.clone(),
        }
    }

    /// Save the current snapshot of an active execution. Failures become
    /// warnings on the execution.
    async fn persist(&self, execution_id: Uuid) {
        let control = self
            .active
            .get(&execution_id)
            .map(|entry| entry.control.clone());
        let Some(control) = control else {
            return;
        };
        let _serial = control.persist.lock().await;

        let snapshot = self
            .active
            .get(&execution_id)
            .map(|entry| self.snapshot_of(&entry));
        let Some(snapshot) = snapshot else {
            return;
        };

        if let Err(e) = self.checkpoints.checkpoint(&snapshot).await {
            tracing::warn!(
                %execution_id,
                status = %snapshot.status,
                error = %e,
                "failed to persist execution snapshot"
            );
            if let Some(mut entry) = self.active.get_mut(&execution_id) {
                entry
                    .record
                    .warnings
                    .push(format!("failed to persist {} snapshot: {e}", snapshot.status));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current status: the active registry first, then the repository.
    pub async fn get_status(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionStatus>, ExecutorError> {
        Ok(self
            .get_execution(execution_id)
            .await?
            .map(|execution| execution.status))
    }

    /// Full execution record: the active registry first, then the repository.
    pub async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<WorkflowExecution>, ExecutorError> {
        let active = self
            .active
            .get(&execution_id)
            .map(|entry| entry.record.clone());
        if active.is_some() {
            return Ok(active);
        }
        let snapshot = self.checkpoints.latest(execution_id).await?;
        Ok(snapshot.map(|s| s.to_execution()))
    }

    /// Executions that have not yet reached a terminal status, oldest first.
    pub fn list_active(&self) -> Vec<WorkflowExecution> {
        let mut executions: Vec<WorkflowExecution> = self
            .active
            .iter()
            .filter(|entry| !entry.record.status.is_terminal())
            .map(|entry| entry.record.clone())
            .collect();
        executions.sort_by_key(|e| e.started_at);
        executions
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// `Running -> Paused`. Takes effect at the next step boundary.
    pub async fn pause(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        self.set_paused(execution_id, true).await?;
        self.persist(execution_id).await;
        self.events
            .publish(WorkflowEvent::ExecutionPaused { execution_id });
        tracing::info!(%execution_id, "execution paused");
        Ok(())
    }

    /// `Paused -> Running`. Releases the pause gate.
    pub async fn resume(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        self.set_paused(execution_id, false).await?;
        self.persist(execution_id).await;
        self.events
            .publish(WorkflowEvent::ExecutionResumed { execution_id });
        tracing::info!(%execution_id, "execution resumed");
        Ok(())
    }

    /// Cancel a `Pending`, `Running`, or `Paused` execution.
    ///
    /// The terminal snapshot is persisted before this returns. No
    /// compensation runs for cancelled executions.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        let outcome = self.active.get_mut(&execution_id).map(|mut entry| {
            let from = entry.record.status;
            if !from.can_transition_to(ExecutionStatus::Cancelled) {
                return Err(ExecutorError::InvalidStateTransition {
                    execution_id,
                    from,
                    to: ExecutionStatus::Cancelled,
                });
            }

            entry.record.status = ExecutionStatus::Cancelled;
            entry.record.completed_at = Some(self.clock.now());
            entry.control.cancel.cancel();
            if from == ExecutionStatus::Pending {
                self.metrics
                    .record_start(&entry.record.workflow_name, execution_id);
            }
            tracing::info!(%execution_id, %from, "execution cancelled");
            Ok(())
        });

        match outcome {
            Some(Ok(())) => {
                self.finalize(execution_id).await;
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(self
                .inactive_error(execution_id, ExecutionStatus::Cancelled)
                .await),
        }
    }

    /// Flip the pause gate together with the status so the run loop never
    /// observes one without the other.
    async fn set_paused(&self, execution_id: Uuid, paused: bool) -> Result<(), ExecutorError> {
        let to = if paused {
            ExecutionStatus::Paused
        } else {
            ExecutionStatus::Running
        };

        let outcome = self.active.get_mut(&execution_id).map(|mut entry| {
            let from = entry.record.status;
            if !from.can_transition_to(to) {
                return Err(ExecutorError::InvalidStateTransition {
                    execution_id,
                    from,
                    to,
                });
            }
            entry.record.status = to;
            entry.control.pause.send_replace(paused);
            Ok(())
        });

        match outcome {
            Some(result) => result,
            None => Err(self.inactive_error(execution_id, to).await),
        }
    }

    /// Error for a control operation on an execution that is no longer
    /// active: finished executions report their final status.
    async fn inactive_error(&self, execution_id: Uuid, to: ExecutionStatus) -> ExecutorError {
        match self.checkpoints.latest(execution_id).await {
            Ok(Some(snapshot)) => ExecutorError::InvalidStateTransition {
                execution_id,
                from: snapshot.status,
                to,
            },
            Ok(None) => ExecutorError::ExecutionNotFound(execution_id),
            Err(e) => ExecutorError::Checkpoint(e),
        }
    }
}

impl<R: ExecutionRepository> std::fmt::Debug for WorkflowEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.config)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

fn duration_ms(started_at: DateTime<Utc>, completed_at: Option<DateTime<Utc>>) -> u64 {
    completed_at
        .map(|end| (end - started_at).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
