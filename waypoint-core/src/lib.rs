pub mod agent;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod ipc;
pub mod memory;
pub mod models;
pub mod schema;
pub mod workflow;

pub use agent::{Agent, GenerateOptions, GenerateResult, LanguageModel, MemoryScope};
pub use config::WaypointConfig;
pub use embeddings::{
    create_backend, BackendConfig, EmbeddingBackend, EmbeddingError, FallbackEmbeddingClient,
    HashEmbedder, HttpEmbeddingClient, HASH_DIMENSIONS,
};
pub use error::{Result, WaypointError};
pub use memory::{ContextBundle, ConversationalMemory, MemoryStore};
pub use schema::{Field, Schema, ValidationError};
pub use workflow::{create_workflow, RunOutcome, StepDefinition, StepOutcome, WorkflowEngine};
