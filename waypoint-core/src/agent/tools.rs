//! Tools: named capabilities an agent can hand to the model.
//!
//! Every tool looks the same to the agent regardless of where it runs:
//! a name, a description, an input schema and `invoke`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::Client;
use serde_json::{json, Value};

use crate::agent::model::ToolSpec;
use crate::error::{Result, WaypointError};
use crate::memory::ConversationalMemory;
use crate::schema::{Field, Schema};

pub const WORKING_MEMORY_TOOL: &str = "updateWorkingMemory";

/// Who the current call is on behalf of.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub resource_id: Option<String>,
    pub thread_id: Option<String>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn input_schema(&self) -> &Schema;

    async fn invoke(&self, input: Value, ctx: &ToolContext) -> Result<Value>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema().describe(),
        }
    }
}

fn invocation_error(tool: &str, message: impl std::fmt::Display) -> WaypointError {
    WaypointError::ToolInvocationError {
        tool: tool.to_string(),
        message: message.to_string(),
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec()).collect()
    }

    /// Look up `name`, coerce `input` to its schema and invoke it.
    pub async fn invoke(&self, name: &str, input: Value, ctx: &ToolContext) -> Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| invocation_error(name, "unknown tool"))?;
        let input = tool
            .input_schema()
            .coerce(&input)
            .map_err(|e| invocation_error(name, e))?;
        tool.invoke(input, ctx).await
    }
}

// ============================================================================
// FnTool
// ============================================================================

type ToolFn = dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// Local tool backed by an async closure.
pub struct FnTool {
    name: String,
    description: String,
    input_schema: Schema,
    f: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, input_schema: Schema, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            f: Box::new(move |input| Box::pin(f(input))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    async fn invoke(&self, input: Value, _ctx: &ToolContext) -> Result<Value> {
        (self.f)(input)
            .await
            .map_err(|e| invocation_error(&self.name, format!("{e:#}")))
    }
}

// ============================================================================
// HttpTool
// ============================================================================

/// Remote tool: `POST {url}` with the input as JSON, JSON back.
pub struct HttpTool {
    name: String,
    description: String,
    input_schema: Schema,
    url: String,
    client: Client,
}

impl HttpTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Schema,
        url: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| invocation_error(&name, e))?;
        Ok(Self {
            name,
            description: description.into(),
            input_schema,
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    async fn invoke(&self, input: Value, _ctx: &ToolContext) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .json(&input)
            .send()
            .await
            .map_err(|e| invocation_error(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(invocation_error(&self.name, format!("HTTP {status}: {body}")));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| invocation_error(&self.name, e))
    }
}

// ============================================================================
// Working memory tool
// ============================================================================

/// Built-in tool that lets the model patch the current resource's working
/// memory. Only merges are possible through it.
pub struct WorkingMemoryTool {
    memory: Arc<ConversationalMemory>,
    input_schema: Schema,
}

impl WorkingMemoryTool {
    pub fn new(memory: Arc<ConversationalMemory>) -> Self {
        let input_schema = Schema::passthrough_object([Field::optional("memory", Schema::Any)
            .describe("Fields to set, e.g. {\"likes\": \"sushi\"} or {\"INTERESTS\": {\"likes\": \"hiking\"}}; null blanks a field")]);
        Self {
            memory,
            input_schema,
        }
    }
}

#[async_trait]
impl Tool for WorkingMemoryTool {
    fn name(&self) -> &str {
        WORKING_MEMORY_TOOL
    }

    fn description(&self) -> &str {
        "Update the working memory profile of the current user. Only the given fields change."
    }

    fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    async fn invoke(&self, input: Value, ctx: &ToolContext) -> Result<Value> {
        let resource_id = ctx
            .resource_id
            .as_deref()
            .ok_or_else(|| invocation_error(WORKING_MEMORY_TOOL, "no resource bound to this call"))?;

        // Models sometimes wrap the patch in {"memory": {...}}
        let patch = match input.get("memory") {
            Some(inner @ Value::Object(_)) if input.as_object().is_some_and(|o| o.len() == 1) => {
                inner.clone()
            }
            _ => input,
        };

        let doc = self.memory.update_working_memory(resource_id, &patch).await?;
        Ok(json!({"success": true, "version": doc.version}))
    }
}
