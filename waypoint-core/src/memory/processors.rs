//! Context processors run over the assembled bundle before it reaches the
//! model. The token limiter always runs last.

use std::sync::Arc;

use crate::error::Result;
use crate::memory::budget::TokenBudgeter;
use crate::memory::facade::ContextBundle;
use crate::models::Role;

pub trait ContextProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, bundle: ContextBundle) -> Result<ContextBundle>;
}

/// Removes tool messages from both recent and recalled history.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolCallFilter;

impl ContextProcessor for ToolCallFilter {
    fn name(&self) -> &str {
        "tool-call-filter"
    }

    fn process(&self, mut bundle: ContextBundle) -> Result<ContextBundle> {
        bundle.recent_messages.retain(|m| m.role != Role::Tool);
        bundle.recalled_messages.retain(|m| m.role != Role::Tool);
        Ok(bundle)
    }
}

#[derive(Clone)]
pub struct ProcessorPipeline {
    processors: Vec<Arc<dyn ContextProcessor>>,
    limiter: TokenBudgeter,
}

impl ProcessorPipeline {
    pub fn new(limiter: TokenBudgeter) -> Self {
        Self {
            processors: Vec::new(),
            limiter,
        }
    }

    pub fn with(mut self, processor: Arc<dyn ContextProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_limiter(mut self, limiter: TokenBudgeter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn limiter(&self) -> &TokenBudgeter {
        &self.limiter
    }

    pub fn run(&self, bundle: ContextBundle) -> Result<ContextBundle> {
        let mut bundle = bundle;
        for processor in &self.processors {
            bundle = processor.process(bundle)?;
            tracing::trace!(processor = processor.name(), "Context processor applied");
        }
        self.limiter.trim(bundle)
    }
}
