//! Conversational memory facade.
//!
//! `assemble_context` is the one call an agent makes before talking to the
//! model. It persists the incoming message, gathers recent history, semantic
//! recall and working memory, and runs the processor pipeline (token limiter
//! last).

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::embeddings::EmbeddingBackend;
use crate::error::{Result, WaypointError};
use crate::memory::budget::TokenBudgeter;
use crate::memory::processors::{ContextProcessor, ProcessorPipeline};
use crate::memory::recall::SemanticRecall;
use crate::memory::store::{MemoryStore, MessageRange};
use crate::memory::working::WorkingMemoryManager;
use crate::models::{Message, NewMessage, Role, WorkingMemory};

/// Everything the model sees from memory for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub recent_messages: Vec<Message>,
    pub recalled_messages: Vec<Message>,
    pub working_memory: Option<WorkingMemory>,
}

impl ContextBundle {
    /// Flatten into model input: working memory and recalled history as
    /// system messages, then the recent conversation.
    pub fn to_model_messages(&self) -> Vec<NewMessage> {
        let mut out = Vec::with_capacity(self.recent_messages.len() + 2);

        if let Some(wm) = &self.working_memory {
            out.push(NewMessage::system(format!(
                "Working memory for this user (keep it current with updateWorkingMemory):\n{}",
                wm.content
            )));
        }

        if !self.recalled_messages.is_empty() {
            let mut block = String::from("Relevant messages from earlier conversations:");
            for m in &self.recalled_messages {
                block.push_str(&format!("\n[{}] {}", m.role.as_str(), m.content.as_text()));
            }
            out.push(NewMessage::system(block));
        }

        out.extend(self.recent_messages.iter().map(NewMessage::from));
        out
    }
}

pub struct ConversationalMemory {
    store: Arc<dyn MemoryStore>,
    recall: Option<SemanticRecall>,
    working: Option<WorkingMemoryManager>,
    pipeline: ProcessorPipeline,
    config: MemoryConfig,
}

impl ConversationalMemory {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn EmbeddingBackend>,
        config: MemoryConfig,
    ) -> Self {
        let recall = config
            .semantic_recall
            .enabled
            .then(|| SemanticRecall::new(store.clone(), embedder, config.semantic_recall.clone()));
        let working = config
            .working_memory
            .enabled
            .then(|| WorkingMemoryManager::new(store.clone(), config.working_memory.clone()));
        let pipeline = ProcessorPipeline::new(TokenBudgeter::new(config.token_limit));

        Self {
            store,
            recall,
            working,
            pipeline,
            config,
        }
    }

    /// Insert a processor ahead of the token limiter.
    pub fn with_processor(mut self, processor: Arc<dyn ContextProcessor>) -> Self {
        self.pipeline = self.pipeline.with(processor);
        self
    }

    pub fn with_budgeter(mut self, budgeter: TokenBudgeter) -> Self {
        self.pipeline = self.pipeline.with_limiter(budgeter);
        self
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn working_memory(&self) -> Option<&WorkingMemoryManager> {
        self.working.as_ref()
    }

    pub async fn assemble_context(
        &self,
        resource_id: &str,
        thread_id: &str,
        new_message: NewMessage,
    ) -> Result<ContextBundle> {
        self.store.ensure_thread(thread_id, resource_id).await?;
        let stored = self.store.append_message(thread_id, new_message).await?;

        let recent_messages = self
            .store
            .get_messages(thread_id, MessageRange::last(self.config.last_messages))
            .await?;

        let recalled_messages = match &self.recall {
            Some(recall) => {
                let exclude: HashSet<Uuid> = recent_messages.iter().map(|m| m.id).collect();
                let recalled = recall
                    .recall(resource_id, thread_id, &stored.content.as_text(), &exclude)
                    .await?;
                recall.index(&stored).await?;
                recalled
            }
            None => Vec::new(),
        };

        let working_memory = match &self.working {
            Some(manager) => Some(manager.read(resource_id).await?),
            None => None,
        };

        let bundle = ContextBundle {
            recent_messages,
            recalled_messages,
            working_memory,
        };
        let bundle = self.pipeline.run(bundle)?;

        tracing::debug!(
            resource_id = %resource_id,
            thread_id = %thread_id,
            recent = bundle.recent_messages.len(),
            recalled = bundle.recalled_messages.len(),
            "Context assembled"
        );
        Ok(bundle)
    }

    /// Persist and index a message without assembling context.
    pub async fn save_message(
        &self,
        resource_id: &str,
        thread_id: &str,
        message: NewMessage,
    ) -> Result<Message> {
        self.store.ensure_thread(thread_id, resource_id).await?;
        let stored = self.store.append_message(thread_id, message).await?;
        if let Some(recall) = &self.recall {
            if stored.role != Role::Tool {
                recall.index(&stored).await?;
            }
        }
        Ok(stored)
    }

    pub async fn get_working_memory(&self, resource_id: &str) -> Result<WorkingMemory> {
        self.working_manager(resource_id)?.read(resource_id).await
    }

    pub async fn update_working_memory(&self, resource_id: &str, patch: &Value) -> Result<WorkingMemory> {
        self.working_manager(resource_id)?.update(resource_id, patch).await
    }

    fn working_manager(&self, resource_id: &str) -> Result<&WorkingMemoryManager> {
        self.working.as_ref().ok_or_else(|| WaypointError::WorkingMemoryPolicy {
            resource_id: resource_id.to_string(),
            reason: "working memory is disabled".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use crate::memory::processors::ToolCallFilter;
    use crate::memory::store::InMemoryStore;
    use serde_json::json;

    fn memory(config: MemoryConfig) -> ConversationalMemory {
        ConversationalMemory::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(HashEmbedder::new(128)),
            config,
        )
    }

    #[tokio::test]
    async fn test_first_turn_creates_thread_and_seeds_working_memory() {
        let memory = memory(MemoryConfig::default());
        let bundle = memory
            .assemble_context("alice", "t1", NewMessage::user("hello"))
            .await
            .unwrap();

        assert_eq!(bundle.recent_messages.len(), 1);
        assert!(bundle.recalled_messages.is_empty());
        let wm = bundle.working_memory.unwrap();
        assert!(wm.content.contains("# USER PROFILE"));
        assert!(memory.store().get_thread("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recent_window_respects_last_messages() {
        let config = MemoryConfig {
            last_messages: 5,
            ..MemoryConfig::default()
        };
        let memory = memory(config);
        for i in 0..8 {
            memory
                .save_message("alice", "t1", NewMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let bundle = memory
            .assemble_context("alice", "t1", NewMessage::user("latest"))
            .await
            .unwrap();
        let texts: Vec<String> = bundle.recent_messages.iter().map(|m| m.content.as_text()).collect();
        assert_eq!(texts, vec!["m4", "m5", "m6", "m7", "latest"]);
    }

    #[tokio::test]
    async fn test_recall_pulls_from_other_threads_of_same_resource() {
        let memory = memory(MemoryConfig::default());
        memory
            .save_message("alice", "old", NewMessage::user("my favourite city is Lisbon"))
            .await
            .unwrap();

        let bundle = memory
            .assemble_context("alice", "new", NewMessage::user("what is my favourite city"))
            .await
            .unwrap();
        assert!(bundle
            .recalled_messages
            .iter()
            .any(|m| m.content.as_text().contains("Lisbon")));
    }

    #[tokio::test]
    async fn test_tool_filter_applies_before_budget() {
        let memory = memory(MemoryConfig::default()).with_processor(Arc::new(ToolCallFilter));
        memory
            .save_message("alice", "t1", NewMessage::tool(json!({"result": 1})))
            .await
            .unwrap();
        let bundle = memory
            .assemble_context("alice", "t1", NewMessage::user("hi"))
            .await
            .unwrap();
        assert!(bundle.recent_messages.iter().all(|m| m.role != Role::Tool));
    }

    #[tokio::test]
    async fn test_model_messages_put_working_memory_first() {
        let memory = memory(MemoryConfig::default());
        let bundle = memory
            .assemble_context("alice", "t1", NewMessage::user("hello"))
            .await
            .unwrap();
        let messages = bundle.to_model_messages();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages.last().unwrap().content.as_text(), "hello");
    }

    #[tokio::test]
    async fn test_disabled_working_memory_rejects_updates() {
        let mut config = MemoryConfig::default();
        config.working_memory.enabled = false;
        let memory = memory(config);
        let err = memory
            .update_working_memory("alice", &json!({"likes": "tea"}))
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::WorkingMemoryPolicy { .. }));
    }
}
