mod message;
mod run;
mod thread;
mod working_memory;

pub use message::{Message, MessageContent, NewMessage, Role};
pub use run::{RunStatus, StepRecord, SuspendState, WorkflowRun};
pub use thread::Thread;
pub use working_memory::{WorkingMemory, WorkingMemoryFormat};
