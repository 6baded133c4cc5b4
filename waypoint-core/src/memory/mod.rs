//! Tiered conversational memory: recent history, semantic recall and a
//! per-resource working-memory document, trimmed to a token budget.

pub mod budget;
pub mod facade;
pub mod postgres;
pub mod processors;
pub mod recall;
pub mod store;
pub mod working;

pub use budget::{ApproxTokenCounter, TokenBudgeter, TokenCounter};
pub use facade::{ContextBundle, ConversationalMemory};
pub use postgres::PgMemoryStore;
pub use processors::{ContextProcessor, ProcessorPipeline, ToolCallFilter};
pub use recall::SemanticRecall;
pub use store::{InMemoryStore, MemoryStore, MessageRange, RecallHit};
pub use working::{merge_document, MergeError, WorkingMemoryManager};
