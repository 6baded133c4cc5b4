//! Token budgeting for assembled context.
//!
//! Trimming order: oldest recalled messages go first, then the oldest recent
//! messages. Working memory is never cut; if it alone exceeds the budget the
//! turn fails with `BudgetUnsatisfiable`.

use std::sync::Arc;

use crate::error::{Result, WaypointError};
use crate::memory::facade::ContextBundle;
use crate::models::Message;

pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;

    fn count_message(&self, message: &Message) -> usize {
        self.count_text(&message.content.as_text())
    }
}

/// Character-based estimate: roughly 4 characters per token, plus a fixed
/// overhead per message for role and framing.
#[derive(Debug, Clone, Copy)]
pub struct ApproxTokenCounter {
    pub chars_per_token: usize,
    pub per_message_overhead: usize,
}

impl Default for ApproxTokenCounter {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            per_message_overhead: 4,
        }
    }
}

impl TokenCounter for ApproxTokenCounter {
    fn count_text(&self, text: &str) -> usize {
        let chars = text.chars().count();
        chars.div_ceil(self.chars_per_token.max(1))
    }

    fn count_message(&self, message: &Message) -> usize {
        self.count_text(&message.content.as_text()) + self.per_message_overhead
    }
}

#[derive(Clone)]
pub struct TokenBudgeter {
    counter: Arc<dyn TokenCounter>,
    max_tokens: usize,
}

impl TokenBudgeter {
    pub fn new(max_tokens: usize) -> Self {
        Self::with_counter(Arc::new(ApproxTokenCounter::default()), max_tokens)
    }

    pub fn with_counter(counter: Arc<dyn TokenCounter>, max_tokens: usize) -> Self {
        Self {
            counter,
            max_tokens,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn count(&self, bundle: &ContextBundle) -> usize {
        self.working_memory_tokens(bundle)
            + bundle
                .recalled_messages
                .iter()
                .chain(bundle.recent_messages.iter())
                .map(|m| self.counter.count_message(m))
                .sum::<usize>()
    }

    fn working_memory_tokens(&self, bundle: &ContextBundle) -> usize {
        bundle
            .working_memory
            .as_ref()
            .map(|wm| self.counter.count_text(&wm.content))
            .unwrap_or(0)
    }

    pub fn trim(&self, mut bundle: ContextBundle) -> Result<ContextBundle> {
        let required = self.working_memory_tokens(&bundle);
        if required > self.max_tokens {
            return Err(WaypointError::BudgetUnsatisfiable {
                required,
                max_tokens: self.max_tokens,
            });
        }

        let mut total = self.count(&bundle);
        let mut dropped = 0usize;
        while total > self.max_tokens {
            let removed = if !bundle.recalled_messages.is_empty() {
                bundle.recalled_messages.remove(0)
            } else if !bundle.recent_messages.is_empty() {
                bundle.recent_messages.remove(0)
            } else {
                break;
            };
            total -= self.counter.count_message(&removed);
            dropped += 1;
        }

        if dropped > 0 {
            tracing::debug!(dropped, total, max_tokens = self.max_tokens, "Context trimmed to budget");
        }
        Ok(bundle)
    }
}
