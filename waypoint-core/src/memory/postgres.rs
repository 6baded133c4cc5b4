//! PostgreSQL + pgvector implementation of `MemoryStore`.
//!
//! - `seq` is allocated from `threads.next_seq` inside the append transaction
//! - Working-memory merges lock the row with `SELECT ... FOR UPDATE`
//! - Recall queries use cosine distance (`<=>`); score = 1 - distance

use async_trait::async_trait;
use pgvector::Vector;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Result, WaypointError};
use crate::memory::store::{rank_hits, MemoryStore, MessageRange, RecallHit};
use crate::memory::working::merge_document;
use crate::models::{Message, NewMessage, Thread, WorkingMemory, WorkingMemoryFormat};
use crate::schema::Schema;

#[derive(Clone)]
pub struct PgMemoryStore {
    pool: PgPool,
}

impl PgMemoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const MESSAGE_COLUMNS: &str = "id, thread_id, resource_id, role, content, seq, created_at";
const WORKING_COLUMNS: &str = "resource_id, format, content, version, updated_at";

#[async_trait]
impl MemoryStore for PgMemoryStore {
    async fn ensure_thread(&self, thread_id: &str, resource_id: &str) -> Result<Thread> {
        sqlx::query(
            "INSERT INTO threads (id, resource_id) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(thread_id)
        .bind(resource_id)
        .execute(&self.pool)
        .await?;

        let thread = sqlx::query_as::<_, Thread>(
            "SELECT id, resource_id, title, created_at, updated_at FROM threads WHERE id = $1",
        )
        .bind(thread_id)
        .fetch_one(&self.pool)
        .await?;

        if thread.resource_id != resource_id {
            return Err(WaypointError::ThreadOwnership {
                thread_id: thread_id.to_string(),
                owner: thread.resource_id,
                requested: resource_id.to_string(),
            });
        }
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        let thread = sqlx::query_as::<_, Thread>(
            "SELECT id, resource_id, title, created_at, updated_at FROM threads WHERE id = $1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(thread)
    }

    async fn list_threads(&self, resource_id: &str) -> Result<Vec<Thread>> {
        let threads = sqlx::query_as::<_, Thread>(
            r#"
            SELECT id, resource_id, title, created_at, updated_at
            FROM threads
            WHERE resource_id = $1
            ORDER BY updated_at DESC, id
            "#,
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(threads)
    }

    async fn set_thread_title(&self, thread_id: &str, title: &str) -> Result<()> {
        let result = sqlx::query("UPDATE threads SET title = $2 WHERE id = $1")
            .bind(thread_id)
            .bind(title)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(WaypointError::ThreadNotFound(thread_id.to_string()));
        }
        Ok(())
    }

    async fn append_message(&self, thread_id: &str, message: NewMessage) -> Result<Message> {
        let mut tx = self.pool.begin().await?;

        let allocated: Option<(i64, String)> = sqlx::query_as(
            r#"
            UPDATE threads
            SET next_seq = next_seq + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING next_seq - 1, resource_id
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (seq, resource_id) =
            allocated.ok_or_else(|| WaypointError::ThreadNotFound(thread_id.to_string()))?;

        let stored = sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO messages (id, thread_id, resource_id, role, content, seq)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(thread_id)
        .bind(&resource_id)
        .bind(message.role.as_str())
        .bind(sqlx::types::Json(&message.content))
        .bind(seq)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn get_messages(&self, thread_id: &str, range: MessageRange) -> Result<Vec<Message>> {
        let messages = match range {
            MessageRange::All => {
                sqlx::query_as::<_, Message>(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = $1 ORDER BY seq"
                ))
                .bind(thread_id)
                .fetch_all(&self.pool)
                .await?
            }
            MessageRange::Last { n } => {
                let mut newest = sqlx::query_as::<_, Message>(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS} FROM messages
                    WHERE thread_id = $1
                    ORDER BY seq DESC
                    LIMIT $2
                    "#
                ))
                .bind(thread_id)
                .bind(n as i64)
                .fetch_all(&self.pool)
                .await?;
                newest.reverse();
                newest
            }
            MessageRange::Seq { from, to } => {
                sqlx::query_as::<_, Message>(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS} FROM messages
                    WHERE thread_id = $1 AND seq BETWEEN $2 AND $3
                    ORDER BY seq
                    "#
                ))
                .bind(thread_id)
                .bind(from)
                .bind(to)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(messages)
    }

    async fn get_working_memory(&self, resource_id: &str) -> Result<Option<WorkingMemory>> {
        let doc = sqlx::query_as::<_, WorkingMemory>(&format!(
            "SELECT {WORKING_COLUMNS} FROM working_memory WHERE resource_id = $1"
        ))
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(doc)
    }

    async fn init_working_memory(
        &self,
        resource_id: &str,
        format: WorkingMemoryFormat,
        content: &str,
    ) -> Result<WorkingMemory> {
        sqlx::query(
            r#"
            INSERT INTO working_memory (resource_id, format, content)
            VALUES ($1, $2, $3)
            ON CONFLICT (resource_id) DO NOTHING
            "#,
        )
        .bind(resource_id)
        .bind(format.as_str())
        .bind(content)
        .execute(&self.pool)
        .await?;

        self.get_working_memory(resource_id)
            .await?
            .ok_or_else(|| WaypointError::WorkingMemoryNotFound(resource_id.to_string()))
    }

    async fn merge_working_memory(
        &self,
        resource_id: &str,
        patch: &Value,
        schema: Option<&Schema>,
    ) -> Result<WorkingMemory> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, WorkingMemory>(&format!(
            "SELECT {WORKING_COLUMNS} FROM working_memory WHERE resource_id = $1 FOR UPDATE"
        ))
        .bind(resource_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| WaypointError::WorkingMemoryNotFound(resource_id.to_string()))?;

        let merged = merge_document(current.format, &current.content, patch, schema)
            .map_err(|e| e.into_policy(resource_id))?;
        if merged == current.content {
            tx.commit().await?;
            return Ok(current);
        }

        let updated = sqlx::query_as::<_, WorkingMemory>(&format!(
            r#"
            UPDATE working_memory
            SET content = $2, version = version + 1, updated_at = NOW()
            WHERE resource_id = $1
            RETURNING {WORKING_COLUMNS}
            "#
        ))
        .bind(resource_id)
        .bind(&merged)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn replace_working_memory(
        &self,
        resource_id: &str,
        format: WorkingMemoryFormat,
        content: &str,
    ) -> Result<WorkingMemory> {
        let doc = sqlx::query_as::<_, WorkingMemory>(&format!(
            r#"
            INSERT INTO working_memory (resource_id, format, content, version)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (resource_id) DO UPDATE
            SET format = EXCLUDED.format,
                content = EXCLUDED.content,
                version = working_memory.version + 1,
                updated_at = NOW()
            RETURNING {WORKING_COLUMNS}
            "#
        ))
        .bind(resource_id)
        .bind(format.as_str())
        .bind(content)
        .fetch_one(&self.pool)
        .await?;
        Ok(doc)
    }

    async fn upsert_embedding(&self, message_id: Uuid, vector: Vec<f32>) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO message_embeddings (message_id, thread_id, resource_id, seq, embedding)
            SELECT id, thread_id, resource_id, seq, $2::vector
            FROM messages WHERE id = $1
            ON CONFLICT (message_id) DO UPDATE SET embedding = EXCLUDED.embedding
            "#,
        )
        .bind(message_id)
        .bind(Vector::from(vector))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WaypointError::Other(format!("message {message_id} not found")));
        }
        Ok(())
    }

    async fn query_nearest(
        &self,
        resource_id: &str,
        vector: &[f32],
        k: usize,
        thread_id: Option<&str>,
    ) -> Result<Vec<RecallHit>> {
        let vector = Vector::from(vector.to_vec());

        let rows = sqlx::query_as::<_, (Uuid, String, i64, f64)>(
            r#"
            SELECT message_id, thread_id, seq, 1 - (embedding <=> $1::vector) AS score
            FROM message_embeddings
            WHERE resource_id = $2
              AND ($3::text IS NULL OR thread_id = $3)
            ORDER BY embedding <=> $1::vector, thread_id, seq
            LIMIT $4
            "#,
        )
        .bind(&vector)
        .bind(resource_id)
        .bind(thread_id)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<RecallHit> = rows
            .into_iter()
            .map(|(message_id, thread_id, seq, score)| RecallHit {
                message_id,
                thread_id,
                seq,
                score: score as f32,
            })
            .collect();
        rank_hits(&mut hits);
        Ok(hits)
    }
}
