//! Agents bind a language model, a tool set and (optionally) conversational
//! memory behind a single `generate` call.

pub mod model;
pub mod tools;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, WaypointError};
use crate::memory::ConversationalMemory;
use crate::models::{MessageContent, NewMessage, Role};
use crate::schema::Schema;

pub use model::{
    HttpModelClient, HttpModelConfig, LanguageModel, ModelError, ModelRequest, ModelResponse,
    ScriptedModel, ToolCall, ToolSpec,
};
pub use tools::{FnTool, HttpTool, Tool, ToolContext, ToolRegistry, WorkingMemoryTool, WORKING_MEMORY_TOOL};

const DEFAULT_MAX_STEPS: usize = 5;
const TITLE_MAX_CHARS: usize = 60;
const TITLE_INSTRUCTIONS: &str =
    "Generate a concise title for this conversation based on the first user message. \
     Reply with the title only.";

/// Which conversation a `generate` call belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryScope {
    pub resource_id: String,
    pub thread_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub output_schema: Option<Schema>,
    pub memory: Option<MemoryScope>,
}

impl GenerateOptions {
    pub fn structured(schema: Schema) -> Self {
        Self {
            output_schema: Some(schema),
            memory: None,
        }
    }

    pub fn with_memory(mut self, resource_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        self.memory = Some(MemoryScope {
            resource_id: resource_id.into(),
            thread_id: thread_id.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    pub text: String,
    /// Present when an output schema was requested; already validated.
    pub object: Option<Value>,
}

pub struct Agent {
    name: String,
    instructions: String,
    model: Arc<dyn LanguageModel>,
    tools: ToolRegistry,
    memory: Option<Arc<ConversationalMemory>>,
    max_steps: usize,
    generate_titles: bool,
}

impl Agent {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            model,
            tools: ToolRegistry::new(),
            memory: None,
            max_steps: DEFAULT_MAX_STEPS,
            generate_titles: false,
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_memory(mut self, memory: Arc<ConversationalMemory>) -> Self {
        self.generate_titles = memory.config().generate_titles;
        self.memory = Some(memory);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory(&self) -> Option<&Arc<ConversationalMemory>> {
        self.memory.as_ref()
    }

    pub async fn generate(&self, messages: Vec<NewMessage>, options: GenerateOptions) -> Result<GenerateResult> {
        let scope = options.memory.as_ref().zip(self.memory.as_ref());

        let mut prompt = vec![NewMessage::system(self.instructions.clone())];
        match scope {
            Some((scope, memory)) => {
                let mut messages = messages;
                let latest = messages
                    .pop()
                    .ok_or_else(|| WaypointError::Other("generate called with no messages".into()))?;
                for earlier in messages {
                    memory
                        .save_message(&scope.resource_id, &scope.thread_id, earlier)
                        .await?;
                }
                let bundle = memory
                    .assemble_context(&scope.resource_id, &scope.thread_id, latest)
                    .await?;
                prompt.extend(bundle.to_model_messages());
            }
            None => prompt.extend(messages),
        }

        let tools = self.tools_for(scope.map(|(_, m)| m));
        let ctx = ToolContext {
            resource_id: options.memory.as_ref().map(|s| s.resource_id.clone()),
            thread_id: options.memory.as_ref().map(|s| s.thread_id.clone()),
        };

        let mut exchange: Vec<NewMessage> = Vec::new();
        let mut step = 0;
        let response = loop {
            step += 1;
            let request = ModelRequest {
                messages: prompt.clone(),
                output_schema: options.output_schema.clone(),
                tools: tools.specs(),
            };
            let response = self
                .model
                .generate(request)
                .await
                .map_err(|e| WaypointError::Model(e.to_string()))?;

            if response.tool_calls.is_empty() || step >= self.max_steps {
                break response;
            }

            let call_message = NewMessage::new(
                Role::Assistant,
                MessageContent::Structured(json!({ "tool_calls": response.tool_calls })),
            );
            prompt.push(call_message.clone());
            exchange.push(call_message);

            for call in &response.tool_calls {
                let output = match tools.invoke(&call.name, call.arguments.clone(), &ctx).await {
                    Ok(output) => output,
                    Err(e) => {
                        tracing::warn!(agent = %self.name, tool = %call.name, error = %e, "Tool call failed");
                        Value::Null
                    }
                };
                let result = NewMessage::tool(json!({
                    "tool_call_id": call.id,
                    "tool": call.name,
                    "result": output,
                }));
                prompt.push(result.clone());
                exchange.push(result);
            }
        };

        let object = match &options.output_schema {
            Some(schema) => {
                let coerced = match &response.object {
                    Some(object) => schema.coerce(object),
                    None => schema.coerce_text(&response.text),
                };
                Some(coerced.map_err(|source| WaypointError::GenerationSchemaViolation {
                    agent: self.name.clone(),
                    source,
                })?)
            }
            None => None,
        };

        let text = match (&object, response.text.is_empty()) {
            (Some(object), true) => object.to_string(),
            _ => response.text,
        };

        if let Some((scope, memory)) = scope {
            for message in exchange {
                memory
                    .save_message(&scope.resource_id, &scope.thread_id, message)
                    .await?;
            }
            memory
                .save_message(&scope.resource_id, &scope.thread_id, NewMessage::assistant(text.clone()))
                .await?;
            if self.generate_titles {
                self.ensure_title(memory, &scope.thread_id).await?;
            }
        }

        tracing::debug!(agent = %self.name, steps = step, structured = object.is_some(), "Generation complete");
        Ok(GenerateResult { text, object })
    }

    fn tools_for(&self, memory: Option<&Arc<ConversationalMemory>>) -> ToolRegistry {
        match memory {
            Some(memory) if memory.working_memory().is_some() => self
                .tools
                .clone()
                .with(Arc::new(WorkingMemoryTool::new(memory.clone()))),
            _ => self.tools.clone(),
        }
    }

    async fn ensure_title(&self, memory: &ConversationalMemory, thread_id: &str) -> Result<()> {
        let Some(thread) = memory.store().get_thread(thread_id).await? else {
            return Ok(());
        };
        if thread.title.is_some() {
            return Ok(());
        }
        let first_user = memory
            .store()
            .get_messages(thread_id, crate::memory::MessageRange::All)
            .await?
            .into_iter()
            .find(|m| m.role == Role::User);
        if let Some(message) = first_user {
            let text = message.content.as_text();
            let title = match self.model_title(&text).await {
                Some(title) => title,
                None => derive_title(&text),
            };
            if !title.is_empty() {
                memory.store().set_thread_title(thread_id, &title).await?;
            }
        }
        Ok(())
    }

    /// Ask the model for a title. `None` when the call fails or says nothing.
    async fn model_title(&self, first_message: &str) -> Option<String> {
        let request = ModelRequest {
            messages: vec![
                NewMessage::system(TITLE_INSTRUCTIONS),
                NewMessage::user(first_message.to_string()),
            ],
            output_schema: None,
            tools: Vec::new(),
        };
        match self.model.generate(request).await {
            Ok(response) => {
                let title = derive_title(response.text.trim().trim_matches(|c| c == '"' || c == '\''));
                (!title.is_empty()).then_some(title)
            }
            Err(e) => {
                tracing::warn!(agent = %self.name, error = %e, "Title generation failed, using first message");
                None
            }
        }
    }
}

/// First line of `text`, cut at a word boundary.
fn derive_title(text: &str) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(TITLE_MAX_CHARS).collect();
    match cut.rfind(' ') {
        Some(idx) if idx > 0 => format!("{}…", &cut[..idx]),
        _ => format!("{cut}…"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::embeddings::HashEmbedder;
    use crate::memory::InMemoryStore;
    use crate::schema::Field;

    fn memory(generate_titles: bool) -> Arc<ConversationalMemory> {
        let config = MemoryConfig {
            generate_titles,
            ..MemoryConfig::default()
        };
        Arc::new(ConversationalMemory::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(HashEmbedder::new(64)),
            config,
        ))
    }

    #[tokio::test]
    async fn test_structured_output_is_coerced_from_text() {
        let model = Arc::new(ScriptedModel::new([ModelResponse::text(
            "Here you go:\n```json\n{\"count\": \"3\"}\n```",
        )]));
        let agent = Agent::new("counter", "Count things", model);
        let schema = Schema::object([Field::required("count", Schema::Integer)]);

        let result = agent
            .generate(vec![NewMessage::user("count")], GenerateOptions::structured(schema))
            .await
            .unwrap();
        assert_eq!(result.object, Some(json!({"count": 3})));
    }

    #[tokio::test]
    async fn test_unparseable_output_is_a_generation_violation() {
        let model = Arc::new(ScriptedModel::new([ModelResponse::text("no idea")]));
        let agent = Agent::new("counter", "Count things", model);
        let schema = Schema::object([Field::required("count", Schema::Integer)]);

        let err = agent
            .generate(vec![NewMessage::user("count")], GenerateOptions::structured(schema))
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::GenerationSchemaViolation { .. }));
    }

    #[tokio::test]
    async fn test_failing_tool_contributes_nothing() {
        let model = Arc::new(ScriptedModel::new([
            ModelResponse::tool_call("explode", json!({})),
            ModelResponse::text("carried on"),
        ]));
        let tools = ToolRegistry::new().with(Arc::new(FnTool::new(
            "explode",
            "Always fails",
            Schema::Any,
            |_| async { anyhow::bail!("kaboom") },
        )));
        let agent = Agent::new("a", "i", model.clone()).with_tools(tools);

        let result = agent
            .generate(vec![NewMessage::user("go")], GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(result.text, "carried on");

        let second = &model.requests().await[1];
        let tool_message = second.messages.last().unwrap();
        assert_eq!(tool_message.role, Role::Tool);
        assert_eq!(tool_message.content.as_text(), json!({"tool_call_id": null, "tool": "explode", "result": null}).to_string());
    }

    #[tokio::test]
    async fn test_memory_agent_updates_working_memory_through_tool() {
        let memory = memory(false);
        let model = Arc::new(ScriptedModel::new([
            ModelResponse::tool_call(WORKING_MEMORY_TOOL, json!({"likes": "ramen"})),
            ModelResponse::text("Noted!"),
        ]));
        let agent = Agent::new("memory-agent", "Remember things", model.clone()).with_memory(memory.clone());

        let result = agent
            .generate(
                vec![NewMessage::user("I love ramen")],
                GenerateOptions::default().with_memory("alice", "t1"),
            )
            .await
            .unwrap();
        assert_eq!(result.text, "Noted!");

        let doc = memory.get_working_memory("alice").await.unwrap();
        assert!(doc.content.contains("- likes: ramen"));
        assert!(doc.content.contains("- dislikes:"));

        let first = &model.requests().await[0];
        assert!(first.tools.iter().any(|t| t.name == WORKING_MEMORY_TOOL));
        assert_eq!(first.messages[1].role, Role::System);
    }

    #[tokio::test]
    async fn test_reply_is_saved_and_thread_titled() {
        let memory = memory(true);
        let model = Arc::new(ScriptedModel::new([ModelResponse::text("Sure.")]));
        let agent = Agent::new("a", "i", model).with_memory(memory.clone());

        agent
            .generate(
                vec![NewMessage::user("Plan a trip to Lisbon")],
                GenerateOptions::default().with_memory("bob", "t9"),
            )
            .await
            .unwrap();

        let thread = memory.store().get_thread("t9").await.unwrap().unwrap();
        assert_eq!(thread.title.as_deref(), Some("Plan a trip to Lisbon"));
        let stored = memory
            .store()
            .get_messages("t9", crate::memory::MessageRange::All)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content.as_text(), "Sure.");
    }

    #[tokio::test]
    async fn test_thread_title_comes_from_model() {
        let memory = memory(true);
        let model = Arc::new(ScriptedModel::new([
            ModelResponse::text("Happy to help."),
            ModelResponse::text("\"Lisbon Weekend Planning\""),
        ]));
        let agent = Agent::new("a", "i", model.clone()).with_memory(memory.clone());

        agent
            .generate(
                vec![NewMessage::user("Plan a trip to Lisbon for the weekend please")],
                GenerateOptions::default().with_memory("bob", "t10"),
            )
            .await
            .unwrap();

        let thread = memory.store().get_thread("t10").await.unwrap().unwrap();
        assert_eq!(thread.title.as_deref(), Some("Lisbon Weekend Planning"));

        let requests = model.requests().await;
        assert_eq!(requests.len(), 2);
        assert!(requests[1].messages[0].content.as_text().contains("concise title"));
        assert!(requests[1].tools.is_empty());

        // titled threads are not retitled
        model.push(ModelResponse::text("Porto works too.")).await;
        agent
            .generate(
                vec![NewMessage::user("And Porto?")],
                GenerateOptions::default().with_memory("bob", "t10"),
            )
            .await
            .unwrap();
        assert_eq!(model.requests().await.len(), 3);
    }

    #[test]
    fn test_derive_title_cuts_at_word_boundary() {
        let long = "word ".repeat(30);
        let title = derive_title(&long);
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= TITLE_MAX_CHARS + 1);
        assert_eq!(derive_title("\n  Hello there \nmore"), "Hello there");
    }
}
