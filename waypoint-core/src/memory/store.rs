//! Memory store: durable home of threads, messages, working memory and the
//! recall index.
//!
//! `MemoryStore` is the seam between the memory subsystem and its storage
//! backend. `InMemoryStore` lives here; the PostgreSQL + pgvector backend is
//! in `memory::postgres`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::embeddings::cosine_similarity;
use crate::error::{Result, WaypointError};
use crate::memory::working::merge_document;
use crate::models::{Message, NewMessage, Thread, WorkingMemory, WorkingMemoryFormat};
use crate::schema::Schema;

/// Which messages of a thread to fetch. Results are always oldest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageRange {
    /// The newest `n` messages.
    Last { n: usize },
    /// Messages with `from <= seq <= to`.
    Seq { from: i64, to: i64 },
    All,
}

impl MessageRange {
    pub fn last(n: usize) -> Self {
        MessageRange::Last { n }
    }

    /// `before` messages preceding `seq`, the message itself, and `after` following it.
    pub fn around(seq: i64, before: usize, after: usize) -> Self {
        MessageRange::Seq {
            from: (seq - before as i64).max(0),
            to: seq + after as i64,
        }
    }
}

/// One nearest-neighbour match from the recall index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallHit {
    pub message_id: Uuid,
    pub thread_id: String,
    pub seq: i64,
    pub score: f32,
}

/// Order hits by score (highest first), then by position for stable ties.
pub fn rank_hits(hits: &mut [RecallHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.thread_id.cmp(&b.thread_id))
            .then_with(|| a.seq.cmp(&b.seq))
    });
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Create the thread on first interaction; a thread never changes owner.
    async fn ensure_thread(&self, thread_id: &str, resource_id: &str) -> Result<Thread>;

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>>;

    /// Threads of a resource, most recently active first.
    async fn list_threads(&self, resource_id: &str) -> Result<Vec<Thread>>;

    async fn set_thread_title(&self, thread_id: &str, title: &str) -> Result<()>;

    /// Append to an existing thread, assigning the next `seq`.
    async fn append_message(&self, thread_id: &str, message: NewMessage) -> Result<Message>;

    async fn get_messages(&self, thread_id: &str, range: MessageRange) -> Result<Vec<Message>>;

    async fn get_working_memory(&self, resource_id: &str) -> Result<Option<WorkingMemory>>;

    /// Insert `content` if the resource has no document yet; return the stored one.
    async fn init_working_memory(
        &self,
        resource_id: &str,
        format: WorkingMemoryFormat,
        content: &str,
    ) -> Result<WorkingMemory>;

    /// Field-level merge, serialized per resource. A json document must still
    /// match `schema` afterwards.
    async fn merge_working_memory(
        &self,
        resource_id: &str,
        patch: &Value,
        schema: Option<&Schema>,
    ) -> Result<WorkingMemory>;

    /// Unrestricted overwrite for administrative use.
    async fn replace_working_memory(
        &self,
        resource_id: &str,
        format: WorkingMemoryFormat,
        content: &str,
    ) -> Result<WorkingMemory>;

    async fn upsert_embedding(&self, message_id: Uuid, vector: Vec<f32>) -> Result<()>;

    /// Top-`k` messages of `resource_id` nearest to `vector`, optionally
    /// restricted to one thread.
    async fn query_nearest(
        &self,
        resource_id: &str,
        vector: &[f32],
        k: usize,
        thread_id: Option<&str>,
    ) -> Result<Vec<RecallHit>>;
}

// ============================================================================
// InMemoryStore
// ============================================================================

struct ThreadEntry {
    thread: Thread,
    messages: Vec<Message>,
}

struct IndexEntry {
    thread_id: String,
    resource_id: String,
    seq: i64,
    vector: Vec<f32>,
}

/// Process-local store. Appends and working-memory merges are serialized;
/// reads share a read lock.
#[derive(Default)]
pub struct InMemoryStore {
    threads: RwLock<HashMap<String, ThreadEntry>>,
    working: RwLock<HashMap<String, Arc<Mutex<WorkingMemory>>>>,
    index: RwLock<HashMap<Uuid, IndexEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn working_slot(&self, resource_id: &str) -> Option<Arc<Mutex<WorkingMemory>>> {
        self.working.read().await.get(resource_id).cloned()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn ensure_thread(&self, thread_id: &str, resource_id: &str) -> Result<Thread> {
        let mut threads = self.threads.write().await;
        if let Some(entry) = threads.get(thread_id) {
            if entry.thread.resource_id != resource_id {
                return Err(WaypointError::ThreadOwnership {
                    thread_id: thread_id.to_string(),
                    owner: entry.thread.resource_id.clone(),
                    requested: resource_id.to_string(),
                });
            }
            return Ok(entry.thread.clone());
        }

        let now = Utc::now();
        let thread = Thread {
            id: thread_id.to_string(),
            resource_id: resource_id.to_string(),
            title: None,
            created_at: now,
            updated_at: now,
        };
        threads.insert(
            thread_id.to_string(),
            ThreadEntry {
                thread: thread.clone(),
                messages: Vec::new(),
            },
        );
        tracing::debug!(thread_id = %thread_id, resource_id = %resource_id, "Thread created");
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .map(|e| e.thread.clone()))
    }

    async fn list_threads(&self, resource_id: &str) -> Result<Vec<Thread>> {
        let threads = self.threads.read().await;
        let mut out: Vec<Thread> = threads
            .values()
            .filter(|e| e.thread.resource_id == resource_id)
            .map(|e| e.thread.clone())
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn set_thread_title(&self, thread_id: &str, title: &str) -> Result<()> {
        let mut threads = self.threads.write().await;
        let entry = threads
            .get_mut(thread_id)
            .ok_or_else(|| WaypointError::ThreadNotFound(thread_id.to_string()))?;
        entry.thread.title = Some(title.to_string());
        Ok(())
    }

    async fn append_message(&self, thread_id: &str, message: NewMessage) -> Result<Message> {
        let mut threads = self.threads.write().await;
        let entry = threads
            .get_mut(thread_id)
            .ok_or_else(|| WaypointError::ThreadNotFound(thread_id.to_string()))?;

        let now = Utc::now();
        let stored = Message {
            id: Uuid::new_v4(),
            thread_id: thread_id.to_string(),
            resource_id: entry.thread.resource_id.clone(),
            role: message.role,
            content: message.content,
            seq: entry.messages.len() as i64,
            created_at: now,
        };
        entry.messages.push(stored.clone());
        entry.thread.updated_at = now;
        Ok(stored)
    }

    async fn get_messages(&self, thread_id: &str, range: MessageRange) -> Result<Vec<Message>> {
        let threads = self.threads.read().await;
        let Some(entry) = threads.get(thread_id) else {
            return Ok(Vec::new());
        };

        let messages = &entry.messages;
        let selected = match range {
            MessageRange::All => messages.clone(),
            MessageRange::Last { n } => messages[messages.len().saturating_sub(n)..].to_vec(),
            MessageRange::Seq { from, to } => messages
                .iter()
                .filter(|m| m.seq >= from && m.seq <= to)
                .cloned()
                .collect(),
        };
        Ok(selected)
    }

    async fn get_working_memory(&self, resource_id: &str) -> Result<Option<WorkingMemory>> {
        match self.working_slot(resource_id).await {
            Some(slot) => Ok(Some(slot.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn init_working_memory(
        &self,
        resource_id: &str,
        format: WorkingMemoryFormat,
        content: &str,
    ) -> Result<WorkingMemory> {
        let mut working = self.working.write().await;
        let slot = working.entry(resource_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(WorkingMemory {
                resource_id: resource_id.to_string(),
                format,
                content: content.to_string(),
                version: 0,
                updated_at: Utc::now(),
            }))
        });
        let doc = slot.lock().await.clone();
        Ok(doc)
    }

    async fn merge_working_memory(
        &self,
        resource_id: &str,
        patch: &Value,
        schema: Option<&Schema>,
    ) -> Result<WorkingMemory> {
        let slot = self
            .working_slot(resource_id)
            .await
            .ok_or_else(|| WaypointError::WorkingMemoryNotFound(resource_id.to_string()))?;

        let mut doc = slot.lock().await;
        let merged = merge_document(doc.format, &doc.content, patch, schema)
            .map_err(|e| e.into_policy(resource_id))?;
        if merged != doc.content {
            doc.content = merged;
            doc.version += 1;
            doc.updated_at = Utc::now();
        }
        Ok(doc.clone())
    }

    async fn replace_working_memory(
        &self,
        resource_id: &str,
        format: WorkingMemoryFormat,
        content: &str,
    ) -> Result<WorkingMemory> {
        self.init_working_memory(resource_id, format, content).await?;
        let slot = self
            .working_slot(resource_id)
            .await
            .ok_or_else(|| WaypointError::WorkingMemoryNotFound(resource_id.to_string()))?;
        let mut doc = slot.lock().await;
        doc.format = format;
        doc.content = content.to_string();
        doc.version += 1;
        doc.updated_at = Utc::now();
        Ok(doc.clone())
    }

    async fn upsert_embedding(&self, message_id: Uuid, vector: Vec<f32>) -> Result<()> {
        let located = {
            let threads = self.threads.read().await;
            threads.values().find_map(|e| {
                e.messages
                    .iter()
                    .find(|m| m.id == message_id)
                    .map(|m| (m.thread_id.clone(), m.resource_id.clone(), m.seq))
            })
        };
        let (thread_id, resource_id, seq) =
            located.ok_or_else(|| WaypointError::Other(format!("message {message_id} not found")))?;

        self.index.write().await.insert(
            message_id,
            IndexEntry {
                thread_id,
                resource_id,
                seq,
                vector,
            },
        );
        Ok(())
    }

    async fn query_nearest(
        &self,
        resource_id: &str,
        vector: &[f32],
        k: usize,
        thread_id: Option<&str>,
    ) -> Result<Vec<RecallHit>> {
        let index = self.index.read().await;
        let mut hits: Vec<RecallHit> = index
            .iter()
            .filter(|(_, e)| e.resource_id == resource_id)
            .filter(|(_, e)| thread_id.map_or(true, |t| e.thread_id == t))
            .filter(|(_, e)| e.vector.len() == vector.len())
            .map(|(id, e)| RecallHit {
                message_id: *id,
                thread_id: e.thread_id.clone(),
                seq: e.seq,
                score: cosine_similarity(vector, &e.vector),
            })
            .collect();
        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TEMPLATE;
    use serde_json::json;

    async fn store_with_thread(messages: usize) -> InMemoryStore {
        let store = InMemoryStore::new();
        store.ensure_thread("t1", "r1").await.unwrap();
        for i in 0..messages {
            store
                .append_message("t1", NewMessage::user(format!("message {i}")))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_last_messages_window_keeps_newest_oldest_first() {
        let store = store_with_thread(25).await;
        let window = store.get_messages("t1", MessageRange::last(20)).await.unwrap();
        assert_eq!(window.len(), 20);
        assert_eq!(window.first().unwrap().content.as_text(), "message 5");
        assert_eq!(window.last().unwrap().content.as_text(), "message 24");
        assert!(window.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn test_around_range_clamps_at_thread_start() {
        let store = store_with_thread(5).await;
        let window = store
            .get_messages("t1", MessageRange::around(1, 2, 1))
            .await
            .unwrap();
        let seqs: Vec<i64> = window.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_append_requires_thread() {
        let store = InMemoryStore::new();
        let err = store
            .append_message("missing", NewMessage::user("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::ThreadNotFound(_)));
    }

    #[tokio::test]
    async fn test_thread_never_changes_owner() {
        let store = InMemoryStore::new();
        store.ensure_thread("t1", "alice").await.unwrap();
        let err = store.ensure_thread("t1", "bob").await.unwrap_err();
        assert!(matches!(err, WaypointError::ThreadOwnership { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_distinct_sequence_numbers() {
        let store = Arc::new(InMemoryStore::new());
        store.ensure_thread("t1", "r1").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_message("t1", NewMessage::user(format!("m{i}")))
                    .await
                    .unwrap()
                    .seq
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (0..50).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_merges_lose_nothing() {
        let store = Arc::new(InMemoryStore::new());
        store
            .init_working_memory("r1", WorkingMemoryFormat::Markdown, DEFAULT_TEMPLATE)
            .await
            .unwrap();

        let fields = [
            ("name", "Sam"),
            ("location", "Berlin"),
            ("likes", "street food"),
            ("dislikes", "pizza"),
            ("conversation style", "brief"),
            ("travel preferences", "trains"),
        ];

        let mut handles = Vec::new();
        for (field, value) in fields {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .merge_working_memory("r1", &json!({ field: value }), None)
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let doc = store.get_working_memory("r1").await.unwrap().unwrap();
        for (field, value) in fields {
            assert!(
                doc.content.contains(&format!("- {field}: {value}")),
                "lost update for {field}: {}",
                doc.content
            );
        }
        assert_eq!(doc.version, fields.len() as i64);
    }

    #[tokio::test]
    async fn test_merge_without_document_fails() {
        let store = InMemoryStore::new();
        let err = store
            .merge_working_memory("nobody", &json!({"likes": "x"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::WorkingMemoryNotFound(_)));
    }

    #[tokio::test]
    async fn test_query_nearest_is_scoped_to_resource() {
        let store = InMemoryStore::new();
        store.ensure_thread("a", "alice").await.unwrap();
        store.ensure_thread("b", "bob").await.unwrap();
        let mine = store.append_message("a", NewMessage::user("x")).await.unwrap();
        let theirs = store.append_message("b", NewMessage::user("x")).await.unwrap();
        store.upsert_embedding(mine.id, vec![1.0, 0.0]).await.unwrap();
        store.upsert_embedding(theirs.id, vec![1.0, 0.0]).await.unwrap();

        let hits = store
            .query_nearest("alice", &[1.0, 0.0], 5, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, mine.id);
    }

    #[tokio::test]
    async fn test_query_nearest_orders_by_score() {
        let store = store_with_thread(3).await;
        let messages = store.get_messages("t1", MessageRange::All).await.unwrap();
        store.upsert_embedding(messages[0].id, vec![0.0, 1.0]).await.unwrap();
        store.upsert_embedding(messages[1].id, vec![1.0, 0.0]).await.unwrap();
        store.upsert_embedding(messages[2].id, vec![0.7, 0.7]).await.unwrap();

        let hits = store.query_nearest("r1", &[1.0, 0.0], 2, None).await.unwrap();
        let seqs: Vec<i64> = hits.iter().map(|h| h.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_replace_is_unrestricted() {
        let store = InMemoryStore::new();
        store
            .init_working_memory("r1", WorkingMemoryFormat::Markdown, DEFAULT_TEMPLATE)
            .await
            .unwrap();
        let doc = store
            .replace_working_memory("r1", WorkingMemoryFormat::Markdown, "")
            .await
            .unwrap();
        assert_eq!(doc.content, "");
        assert_eq!(doc.version, 1);
    }
}
