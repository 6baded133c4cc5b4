use thiserror::Error;
use uuid::Uuid;

use crate::embeddings::EmbeddingError;
use crate::models::RunStatus;
use crate::schema::ValidationError;

#[derive(Error, Debug)]
pub enum WaypointError {
    #[error("Workflow {workflow_id} input rejected: {source}")]
    InputSchemaViolation {
        workflow_id: String,
        #[source]
        source: ValidationError,
    },

    #[error("Run {run_id} step '{step_id}' contract violated ({stage}): {source}")]
    StepContractViolation {
        run_id: Uuid,
        step_id: String,
        stage: ContractStage,
        #[source]
        source: ValidationError,
    },

    #[error("Run {run_id} step '{step_id}' resume input rejected: {source}")]
    ResumeSchemaViolation {
        run_id: Uuid,
        step_id: String,
        #[source]
        source: ValidationError,
    },

    #[error("Run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: Uuid,
        status: RunStatus,
        expected: RunStatus,
    },

    #[error("Run {run_id} step '{step_id}' failed: {message}")]
    StepFailed {
        run_id: Uuid,
        step_id: String,
        message: String,
    },

    #[error("Agent '{agent}' produced output that does not match the requested schema: {source}")]
    GenerationSchemaViolation {
        agent: String,
        #[source]
        source: ValidationError,
    },

    #[error("Working memory needs {required} tokens but the budget is {max_tokens}")]
    BudgetUnsatisfiable { required: usize, max_tokens: usize },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(#[from] ValidationError),

    #[error("Tool '{tool}' failed: {message}")]
    ToolInvocationError { tool: String, message: String },

    #[error("Working memory policy violation for resource '{resource_id}': {reason}")]
    WorkingMemoryPolicy { resource_id: String, reason: String },

    #[error("Thread '{0}' not found")]
    ThreadNotFound(String),

    #[error("Thread '{thread_id}' belongs to resource '{owner}', not '{requested}'")]
    ThreadOwnership {
        thread_id: String,
        owner: String,
        requested: String,
    },

    #[error("No working memory for resource '{0}'")]
    WorkingMemoryNotFound(String),

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("Agent '{0}' not found")]
    AgentNotFound(String),

    #[error("Invalid workflow definition '{workflow_id}': {reason}")]
    WorkflowDefinition { workflow_id: String, reason: String },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl WaypointError {
    /// Step id attached to the error, if it came out of a workflow step.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepContractViolation { step_id, .. }
            | Self::ResumeSchemaViolation { step_id, .. }
            | Self::StepFailed { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// Short machine-readable kind, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InputSchemaViolation { .. } => "input_schema_violation",
            Self::StepContractViolation { .. } => "step_contract_violation",
            Self::ResumeSchemaViolation { .. } => "resume_schema_violation",
            Self::InvalidRunState { .. } => "invalid_run_state",
            Self::StepFailed { .. } => "step_failed",
            Self::GenerationSchemaViolation { .. } => "generation_schema_violation",
            Self::BudgetUnsatisfiable { .. } => "budget_unsatisfiable",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::ToolInvocationError { .. } => "tool_invocation_error",
            Self::WorkingMemoryPolicy { .. } => "working_memory_policy",
            Self::ThreadNotFound(_) => "thread_not_found",
            Self::ThreadOwnership { .. } => "thread_ownership",
            Self::WorkingMemoryNotFound(_) => "working_memory_not_found",
            Self::RunNotFound(_) => "run_not_found",
            Self::WorkflowNotFound(_) => "workflow_not_found",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::WorkflowDefinition { .. } => "workflow_definition",
            Self::Model(_) => "model",
            Self::Embedding(_) => "embedding",
            Self::Database(_) => "database",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Ipc(_) => "ipc",
            Self::Other(_) => "other",
        }
    }
}

/// Which boundary of a step rejected a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractStage {
    Input,
    Output,
    Suspend,
    WorkflowOutput,
}

impl std::fmt::Display for ContractStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Suspend => "suspend payload",
            Self::WorkflowOutput => "workflow output",
        };
        f.write_str(s)
    }
}

pub type Result<T, E = WaypointError> = std::result::Result<T, E>;
