//! Step model, workflow definitions, and build-time validation.
//!
//! Steps are registered explicitly, in order, through [`WorkflowBuilder`].
//! A [`WorkflowDefinition`] is immutable once built and always valid: the
//! builder runs [`WorkflowDefinition::validate`] before handing it out.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use super::context::WorkflowContext;
use super::step_executor::StepError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Invalid workflow definition. Raised at build time, never during execution.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Two steps share a name.
    #[error("configuration error: duplicate step name '{0}'")]
    DuplicateStep(String),

    /// A step's retry budget is below one attempt.
    #[error("configuration error: step '{step}' has retry_count {retry_count}, must be >= 1")]
    InvalidRetryCount { step: String, retry_count: u32 },

    /// Any other structural problem.
    #[error("configuration error: {0}")]
    Configuration(String),
}

// ---------------------------------------------------------------------------
// Handler types
// ---------------------------------------------------------------------------

/// Step handler: receives a snapshot of the execution context and produces
/// the step's output.
pub type StepFn =
    Arc<dyn Fn(WorkflowContext) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;

/// Compensation handler: receives the context and the output the step
/// recorded when it succeeded.
pub type CompensationFn = Arc<
    dyn Fn(WorkflowContext, Value) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync,
>;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One unit of work in a workflow.
#[derive(Clone)]
pub struct Step {
    name: String,
    handler: StepFn,
    retry_count: Option<u32>,
    timeout: Option<Duration>,
    compensation: Option<CompensationFn>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl Step {
    /// Create a step from an async handler.
    ///
    /// ```
    /// use sagaflow_core::workflow::Step;
    /// use serde_json::json;
    ///
    /// let step = Step::new("reserve", |ctx| async move {
    ///     Ok(json!({ "order": ctx.inputs["order"] }))
    /// });
    /// assert_eq!(step.name(), "reserve");
    /// ```
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            retry_count: None,
            timeout: None,
            compensation: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Maximum number of attempts (including the first).
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Bound every individual attempt by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a compensation handler run during saga rollback.
    pub fn with_compensation<F, Fut>(mut self, compensation: F) -> Self
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.compensation = Some(Arc::new(move |ctx, output| {
            Box::pin(compensation(ctx, output))
        }));
        self
    }

    /// Declare input names (documentation only).
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Declare output names (documentation only).
    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Explicit retry budget, if one was set.
    pub fn retry_count(&self) -> Option<u32> {
        self.retry_count
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn has_compensation(&self) -> bool {
        self.compensation.is_some()
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub(crate) fn handler(&self) -> &StepFn {
        &self.handler
    }

    pub(crate) fn compensation(&self) -> Option<&CompensationFn> {
        self.compensation.as_ref()
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("retry_count", &self.retry_count)
            .field("timeout", &self.timeout)
            .field("has_compensation", &self.compensation.is_some())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// An ordered, immutable list of steps plus a name.
///
/// A definition carries no identity of its own: the engine assigns a fresh
/// `workflow_id` to every execution it starts.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    name: String,
    steps: Vec<Step>,
}

impl WorkflowDefinition {
    /// Build and validate a definition in one call.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Result<Self, WorkflowError> {
        let def = Self {
            name: name.into(),
            steps,
        };
        def.validate()?;
        Ok(def)
    }

    /// Start a builder for a workflow named `name`.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Validate structural constraints.
    ///
    /// Checks:
    /// - Name is non-empty
    /// - At least one step exists
    /// - Step names are non-empty and unique
    /// - Every explicit `retry_count` is >= 1
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.name.trim().is_empty() {
            return Err(WorkflowError::Configuration(
                "workflow name must not be empty".to_string(),
            ));
        }

        if self.steps.is_empty() {
            return Err(WorkflowError::Configuration(format!(
                "workflow '{}' must have at least one step",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(WorkflowError::Configuration(format!(
                    "workflow '{}' has a step with an empty name",
                    self.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(WorkflowError::DuplicateStep(step.name.clone()));
            }
            if let Some(retry_count) = step.retry_count {
                if retry_count < 1 {
                    return Err(WorkflowError::InvalidRetryCount {
                        step: step.name.clone(),
                        retry_count,
                    });
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Appends steps in declaration order and validates on [`build`](Self::build).
#[derive(Debug)]
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<Step>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Finish the definition, failing on any configuration error.
    pub fn build(self) -> Result<WorkflowDefinition, WorkflowError> {
        WorkflowDefinition::new(self.name, self.steps)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
