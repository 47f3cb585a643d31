//! Per-execution workflow context and the service-call bridge.
//!
//! `WorkflowContext` is owned by exactly one engine execution. Step handlers
//! receive a clone of it for each attempt; only the step executor writes into
//! `state`, and only after a step succeeds.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Service bridge
// ---------------------------------------------------------------------------

/// A task routed through the service bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub service: String,
    pub method: String,
    pub args: Value,
}

/// Errors from a service bridge call.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("service '{0}' is unavailable")]
    Unavailable(String),

    #[error("{service}.{method} failed: {message}")]
    TaskFailed {
        service: String,
        method: String,
        message: String,
    },
}

/// Orchestrator backend invoked from inside steps.
///
/// Object-safe so a single bridge can be shared across executions as
/// `Arc<dyn ServiceBridge>`.
pub trait ServiceBridge: Send + Sync {
    fn execute_task(&self, request: ServiceRequest) -> BoxFuture<'_, Result<Value, BridgeError>>;
}

/// Bridge used when none was injected. Logs the call and returns `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullServiceBridge;

impl ServiceBridge for NullServiceBridge {
    fn execute_task(&self, request: ServiceRequest) -> BoxFuture<'_, Result<Value, BridgeError>> {
        Box::pin(async move {
            tracing::debug!(
                service = %request.service,
                method = %request.method,
                "no service bridge configured, returning null"
            );
            Ok(Value::Null)
        })
    }
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Execution state for a single workflow run.
///
/// The engine owns the context. Step and compensation handlers receive a
/// clone taken before the call, so it is a read-only snapshot to them:
/// changes a handler makes to `state` or `metadata` are discarded. A step
/// contributes to the execution only through its returned output, which the
/// executor records under `state[step_name]`.
#[derive(Clone)]
pub struct WorkflowContext {
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub workflow_name: String,
    /// Caller-supplied inputs for this execution.
    pub inputs: Value,
    /// Step outputs keyed by step name, in completion order.
    pub state: Map<String, Value>,
    pub metadata: HashMap<String, Value>,
    bridge: Arc<dyn ServiceBridge>,
}

impl WorkflowContext {
    /// Create a context with empty state and the null bridge.
    pub fn new(
        workflow_id: Uuid,
        execution_id: Uuid,
        workflow_name: impl Into<String>,
        inputs: Value,
    ) -> Self {
        Self {
            workflow_id,
            execution_id,
            workflow_name: workflow_name.into(),
            inputs,
            state: Map::new(),
            metadata: HashMap::new(),
            bridge: Arc::new(NullServiceBridge),
        }
    }

    /// Replace the service bridge.
    pub fn with_bridge(mut self, bridge: Arc<dyn ServiceBridge>) -> Self {
        self.bridge = bridge;
        self
    }

    /// Replace the metadata map.
    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Output recorded by a previously completed step.
    pub fn output(&self, step_name: &str) -> Option<&Value> {
        self.state.get(step_name)
    }

    /// Look up a top-level input field.
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    /// Record a successful step's output. Existing entries are never
    /// replaced; returns `false` if `step_name` was already recorded.
    pub(crate) fn record_output(&mut self, step_name: &str, output: Value) -> bool {
        if self.state.contains_key(step_name) {
            tracing::warn!(
                execution_id = %self.execution_id,
                step = step_name,
                "step output already recorded, keeping the first value"
            );
            return false;
        }
        self.state.insert(step_name.to_string(), output);
        true
    }

    /// Invoke `service.method(args)` through the injected bridge.
    pub async fn call_service(
        &self,
        service: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, BridgeError> {
        tracing::debug!(
            execution_id = %self.execution_id,
            service,
            method,
            "calling service"
        );
        self.bridge
            .execute_task(ServiceRequest {
                service: service.to_string(),
                method: method.to_string(),
                args,
            })
            .await
    }

    /// JSON view of the context (bridge excluded).
    pub fn to_json(&self) -> Value {
        json!({
            "workflow_id": self.workflow_id,
            "execution_id": self.execution_id,
            "workflow_name": self.workflow_name,
            "inputs": self.inputs,
            "state": self.state,
            "metadata": self.metadata,
        })
    }
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("workflow_id", &self.workflow_id)
            .field("execution_id", &self.execution_id)
            .field("workflow_name", &self.workflow_name)
            .field("inputs", &self.inputs)
            .field("state", &self.state)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
