//! Step-based workflow engine with human-in-the-loop suspend/resume.

pub mod definition;
pub mod engine;
pub mod step;
pub mod store;

pub use definition::{create_workflow, Workflow, WorkflowBuilder};
pub use engine::{RunOutcome, WorkflowEngine};
pub use step::{FnStep, StepContext, StepDefinition, StepExecutor, StepOutcome};
pub use store::{InMemoryRunStore, PgRunStore, RunStore};
