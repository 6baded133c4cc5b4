use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Legal transitions of the run state machine.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Suspended)
                | (Running, Completed)
                | (Running, Failed)
                | (Suspended, Running)
                | (Suspended, Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "suspended" => Ok(RunStatus::Suspended),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Input and output of one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub input: Value,
    pub output: Value,
}

/// What a suspended run is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendState {
    pub step_id: String,
    pub payload: Value,
    /// `None` means the step accepts any resume input.
    pub resume_schema: Option<Schema>,
    pub suspended_at: DateTime<Utc>,
}

/// Snapshot of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: RunStatus,
    /// Index of the step that runs next (or is suspended).
    pub current_step: usize,
    pub init_data: Value,
    /// Validated input for `current_step`.
    pub pending_input: Value,
    pub steps: Vec<StepRecord>,
    pub suspended: Option<SuspendState>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(workflow_id: impl Into<String>, init_data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            current_step: 0,
            pending_input: init_data.clone(),
            init_data,
            steps: Vec::new(),
            suspended: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
