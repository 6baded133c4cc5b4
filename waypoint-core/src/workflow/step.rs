//! Workflow steps: typed contracts plus an executor.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use crate::schema::Schema;

/// What a step's `execute` returned.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Complete(Value),
    /// Pause the run and hand `payload` to whoever will resume it.
    Suspend(Value),
}

/// Everything a step sees on one invocation.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub step_id: String,
    /// Validated input for this step.
    pub input: Value,
    init_data: Value,
    resume_data: Option<Value>,
}

impl StepContext {
    pub fn new(
        run_id: Uuid,
        step_id: impl Into<String>,
        input: Value,
        init_data: Value,
        resume_data: Option<Value>,
    ) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            input,
            init_data,
            resume_data,
        }
    }

    /// The run's original input.
    pub fn init_data(&self) -> &Value {
        &self.init_data
    }

    /// `None` on first invocation; the validated resume input afterwards.
    pub fn resume_data(&self) -> Option<&Value> {
        self.resume_data.as_ref()
    }

    pub fn suspend(&self, payload: Value) -> StepOutcome {
        StepOutcome::Suspend(payload)
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: StepContext) -> anyhow::Result<StepOutcome>;
}

type StepFn = dyn Fn(StepContext) -> BoxFuture<'static, anyhow::Result<StepOutcome>> + Send + Sync;

/// Executor backed by an async closure.
pub struct FnStep {
    f: Box<StepFn>,
}

impl FnStep {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<StepOutcome>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

#[async_trait]
impl StepExecutor for FnStep {
    async fn execute(&self, ctx: StepContext) -> anyhow::Result<StepOutcome> {
        (self.f)(ctx).await
    }
}

#[derive(Clone)]
pub struct StepDefinition {
    pub id: String,
    pub input_schema: Schema,
    pub output_schema: Schema,
    pub suspend_schema: Option<Schema>,
    pub resume_schema: Option<Schema>,
    pub executor: Arc<dyn StepExecutor>,
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("suspends", &self.suspend_schema.is_some())
            .finish()
    }
}

impl StepDefinition {
    pub fn new(
        id: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            input_schema,
            output_schema,
            suspend_schema: None,
            resume_schema: None,
            executor,
        }
    }

    /// Shorthand for a closure-backed step.
    pub fn from_fn<F, Fut>(id: impl Into<String>, input_schema: Schema, output_schema: Schema, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<StepOutcome>> + Send + 'static,
    {
        Self::new(id, input_schema, output_schema, Arc::new(FnStep::new(f)))
    }

    /// Declare that this step may suspend with `suspend` and be resumed with `resume`.
    pub fn suspendable(mut self, suspend: Schema, resume: Schema) -> Self {
        self.suspend_schema = Some(suspend);
        self.resume_schema = Some(resume);
        self
    }

    pub fn with_suspend_schema(mut self, schema: Schema) -> Self {
        self.suspend_schema = Some(schema);
        self
    }

    pub fn with_resume_schema(mut self, schema: Schema) -> Self {
        self.resume_schema = Some(schema);
        self
    }
}
