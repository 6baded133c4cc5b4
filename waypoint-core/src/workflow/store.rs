//! Run persistence.
//!
//! A run is stored as a full snapshot. `claim_suspended` is the only
//! conditional write: it moves a SUSPENDED run to RUNNING atomically, so two
//! concurrent resumes of the same run cannot both proceed.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, WaypointError};
use crate::models::{RunStatus, WorkflowRun};

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, run: &WorkflowRun) -> Result<()>;

    async fn load_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>>;

    /// SUSPENDED → RUNNING compare-and-swap. Returns the claimed run, or
    /// `None` when the run is missing or not suspended.
    async fn claim_suspended(&self, run_id: Uuid) -> Result<Option<WorkflowRun>>;

    async fn delete_run(&self, run_id: Uuid) -> Result<()>;

    async fn save_suspended_run(&self, run: &WorkflowRun) -> Result<()> {
        if run.status != RunStatus::Suspended || run.suspended.is_none() {
            return Err(WaypointError::InvalidRunState {
                run_id: run.id,
                status: run.status,
                expected: RunStatus::Suspended,
            });
        }
        self.save_run(run).await
    }

    async fn load_suspended_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        Ok(self
            .load_run(run_id)
            .await?
            .filter(|run| run.status == RunStatus::Suspended))
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, WorkflowRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn claim_suspended(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Suspended => {
                run.status = RunStatus::Running;
                run.touch();
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<()> {
        self.runs.write().await.remove(&run_id);
        Ok(())
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (id, workflow_id, status, snapshot, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                snapshot = EXCLUDED.snapshot,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(run.id)
        .bind(&run.workflow_id)
        .bind(run.status.as_str())
        .bind(sqlx::types::Json(run))
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        let row: Option<(sqlx::types::Json<WorkflowRun>,)> =
            sqlx::query_as("SELECT snapshot FROM workflow_runs WHERE id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(snapshot,)| snapshot.0))
    }

    async fn claim_suspended(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        let row: Option<(sqlx::types::Json<WorkflowRun>,)> = sqlx::query_as(
            r#"
            UPDATE workflow_runs
            SET status = 'running',
                snapshot = jsonb_set(snapshot, '{status}', '"running"'),
                updated_at = NOW()
            WHERE id = $1 AND status = 'suspended'
            RETURNING snapshot
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(snapshot,)| {
            let mut run = snapshot.0;
            run.touch();
            run
        }))
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM workflow_runs WHERE id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
