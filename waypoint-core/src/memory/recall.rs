//! Semantic recall: embeds messages, indexes them, and pulls relevant
//! history (plus neighbouring context) back into the prompt.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::{RecallScope, SemanticRecallConfig};
use crate::embeddings::EmbeddingBackend;
use crate::error::Result;
use crate::memory::store::{MemoryStore, MessageRange};
use crate::models::Message;

pub struct SemanticRecall {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn EmbeddingBackend>,
    config: SemanticRecallConfig,
}

impl SemanticRecall {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn EmbeddingBackend>,
        config: SemanticRecallConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &SemanticRecallConfig {
        &self.config
    }

    /// Find messages relevant to `query`, expanded to their neighbours.
    ///
    /// Messages whose ids are in `exclude` (the recency window) are dropped.
    /// The result is deduplicated and ordered oldest first. An embedder that
    /// yields no vector produces an empty recall.
    pub async fn recall(
        &self,
        resource_id: &str,
        thread_id: &str,
        query: &str,
        exclude: &HashSet<Uuid>,
    ) -> Result<Vec<Message>> {
        if self.config.top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let Some(vector) = self.embedder.embed_query(query).await? else {
            tracing::warn!(
                backend = self.embedder.name(),
                "Embedding unavailable, skipping semantic recall"
            );
            return Ok(Vec::new());
        };

        let thread_filter = match self.config.scope {
            RecallScope::Thread => Some(thread_id),
            RecallScope::Resource => None,
        };
        let hits = self
            .store
            .query_nearest(resource_id, &vector, self.config.top_k, thread_filter)
            .await?;

        let mut seen: HashSet<Uuid> = exclude.clone();
        let mut recalled = Vec::new();
        for hit in &hits {
            let window = self
                .store
                .get_messages(
                    &hit.thread_id,
                    MessageRange::around(hit.seq, self.config.before, self.config.after),
                )
                .await?;
            for message in window {
                if seen.insert(message.id) {
                    recalled.push(message);
                }
            }
        }

        recalled.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.thread_id.cmp(&b.thread_id))
                .then_with(|| a.seq.cmp(&b.seq))
        });

        tracing::debug!(
            resource_id = %resource_id,
            hits = hits.len(),
            recalled = recalled.len(),
            "Semantic recall complete"
        );
        Ok(recalled)
    }

    /// Add a stored message to the recall index.
    pub async fn index(&self, message: &Message) -> Result<()> {
        let text = message.content.as_text();
        if text.trim().is_empty() {
            return Ok(());
        }
        match self.embedder.embed(&text).await? {
            Some(vector) => self.store.upsert_embedding(message.id, vector).await,
            None => {
                tracing::warn!(message_id = %message.id, "Embedding unavailable, message not indexed");
                Ok(())
            }
        }
    }
}
