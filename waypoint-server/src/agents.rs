//! Agents registered by the server.
//!
//! The travel and memory agents share the server's [`ConversationalMemory`],
//! so a traveller's working-memory profile is visible to either of them. The
//! financial agent keeps its own, lighter profile: titled threads and recent
//! history only.

use std::sync::Arc;

use waypoint_core::config::{AgentConfig, MemoryConfig};
use waypoint_core::{Agent, ConversationalMemory, LanguageModel};

pub const TRAVEL_AGENT: &str = "travelAgent";
pub const MEMORY_AGENT: &str = "memoryAgent";
pub const FINANCIAL_AGENT: &str = "financialAgent";

const TRAVEL_INSTRUCTIONS: &str = "ROLE DEFINITION
- You are a travel assistant that helps users discover new destinations and activities based on their travel preferences.
- Primary users are travelers seeking to plan their next adventure.

CORE CAPABILITIES
- Suggest destinations and activities that match the user's preferences.
- Answer questions about specific destinations or activities.
- Turn a chosen destination into a concrete day-by-day travel plan.

BEHAVIORAL GUIDELINES
- Maintain a professional and friendly communication style.
- Keep responses concise but informative.
- Ask for clarification when a request is missing information you need.
- Use what you remember about the user to personalise suggestions.

MEMORY CAPABILITIES
- You remember details about users across conversations.
- When a user says they like or dislike something, record it in working memory.
- Update only the specific fields that changed. Never clear the working memory.

CONSTRAINTS & BOUNDARIES
- Stay on travel, bookings and local events at the destination.";

const MEMORY_INSTRUCTIONS: &str = "You are a helpful assistant with long-term memory.
- Keep the user profile in working memory up to date as you learn about the user.
- Update individual fields only. Never clear or rewrite the whole profile.
- Use recalled messages from earlier conversations when they are relevant.";

const FINANCIAL_INSTRUCTIONS: &str = "ROLE DEFINITION
- You are a financial assistant that helps users analyze their transaction data.
- Provide insights about spending to individual users who want to understand it.

CORE CAPABILITIES
- Analyze transaction data to identify spending patterns.
- Answer questions about specific transactions or vendors.
- Summarise spending by category or time period.

BEHAVIORAL GUIDELINES
- Maintain a professional and friendly communication style.
- Keep responses concise but informative.
- Ask for clarification when you need more information to answer.
- Format currency values appropriately.

CONSTRAINTS & BOUNDARIES
- Do not provide financial investment advice.
- Stay within the transaction data provided.
- Never assume anything about the user's finances beyond what is in the data.

TOOLS
- Use the getTransactions tool, when available, to fetch transaction data.";

/// Memory profile of the financial agent: the top-level limits with recall and
/// working memory switched off and thread titles on.
pub fn financial_memory_profile(base: &MemoryConfig) -> MemoryConfig {
    let mut profile = base.clone();
    profile.generate_titles = true;
    profile.semantic_recall.enabled = false;
    profile.working_memory.enabled = false;
    profile
}

pub fn travel_agent(
    model: Arc<dyn LanguageModel>,
    memory: Arc<ConversationalMemory>,
    config: &AgentConfig,
) -> Agent {
    Agent::new(TRAVEL_AGENT, TRAVEL_INSTRUCTIONS, model)
        .with_memory(memory)
        .with_max_steps(config.max_steps)
}

pub fn memory_agent(
    model: Arc<dyn LanguageModel>,
    memory: Arc<ConversationalMemory>,
    config: &AgentConfig,
) -> Agent {
    Agent::new(MEMORY_AGENT, MEMORY_INSTRUCTIONS, model)
        .with_memory(memory)
        .with_max_steps(config.max_steps)
}

pub fn financial_agent(
    model: Arc<dyn LanguageModel>,
    memory: Arc<ConversationalMemory>,
    config: &AgentConfig,
) -> Agent {
    Agent::new(FINANCIAL_AGENT, FINANCIAL_INSTRUCTIONS, model)
        .with_memory(memory)
        .with_max_steps(config.max_steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_financial_profile_keeps_limits_but_drops_recall_and_profile() {
        let base = MemoryConfig {
            last_messages: 12,
            ..MemoryConfig::default()
        };
        let profile = financial_memory_profile(&base);
        assert_eq!(profile.last_messages, 12);
        assert!(profile.generate_titles);
        assert!(!profile.semantic_recall.enabled);
        assert!(!profile.working_memory.enabled);
    }
}
