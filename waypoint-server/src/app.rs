//! Composition root: builds stores, memory, agents and workflows once at
//! startup and hands the result to the IPC and HTTP surfaces.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use waypoint_core::agent::{HttpModelClient, HttpModelConfig, HttpTool, ToolRegistry};
use waypoint_core::config::MemoryConfig;
use waypoint_core::memory::{InMemoryStore, PgMemoryStore};
use waypoint_core::workflow::{InMemoryRunStore, PgRunStore, RunStore};
use waypoint_core::{
    create_backend, Agent, BackendConfig, ConversationalMemory, EmbeddingBackend, LanguageModel,
    MemoryStore, Schema, WaypointConfig, WaypointError, WorkflowEngine,
};

use crate::agents;
use crate::workflows;

pub struct App {
    pub config: WaypointConfig,
    /// `None` when running on in-memory stores.
    pub pool: Option<PgPool>,
    pub engine: WorkflowEngine,
    /// Default memory profile, also served by the memory endpoints.
    pub memory: Arc<ConversationalMemory>,
    agents: HashMap<String, Arc<Agent>>,
}

impl App {
    /// Connect to the configured backends and wire everything together.
    pub async fn build(config: WaypointConfig) -> anyhow::Result<Self> {
        let pool = match &config.database {
            Some(db) => {
                let pool = waypoint_core::db::create_pool(db)
                    .await
                    .context("Failed to connect to database")?;
                waypoint_core::db::init_schema(&pool)
                    .await
                    .context("Failed to initialise schema")?;
                Some(pool)
            }
            None => {
                tracing::info!("No [database] configured, using in-memory stores");
                None
            }
        };

        let model = HttpModelClient::new(HttpModelConfig::from_config(&config.model)?)?;
        Self::assemble(config, pool, Arc::new(model))
    }

    /// Wire the app around an already-chosen model. Stores follow `pool`.
    pub fn assemble(
        config: WaypointConfig,
        pool: Option<PgPool>,
        model: Arc<dyn LanguageModel>,
    ) -> anyhow::Result<Self> {
        let (memory_store, run_store): (Arc<dyn MemoryStore>, Arc<dyn RunStore>) = match &pool {
            Some(pool) => (
                Arc::new(PgMemoryStore::new(pool.clone())),
                Arc::new(PgRunStore::new(pool.clone())),
            ),
            None => (Arc::new(InMemoryStore::new()), Arc::new(InMemoryRunStore::new())),
        };

        let embedder: Arc<dyn EmbeddingBackend> =
            Arc::from(create_backend(BackendConfig::from_config(&config.embedding)?)?);
        tracing::info!(
            backend = embedder.name(),
            dimensions = embedder.dimensions(),
            "Embedding backend ready"
        );

        let memory = Arc::new(ConversationalMemory::new(
            memory_store.clone(),
            embedder.clone(),
            config.memory.clone(),
        ));

        // An agent with a `[agents.<name>.memory]` override gets its own view
        // over the same stores.
        let memory_for = |name: &str, builtin: Option<MemoryConfig>| -> Arc<ConversationalMemory> {
            let profile = config
                .agent_profile(name)
                .and_then(|p| p.memory.clone())
                .or(builtin);
            match profile {
                Some(profile) => {
                    tracing::info!(
                        agent = name,
                        recall = profile.semantic_recall.enabled,
                        working_memory = profile.working_memory.enabled,
                        "Agent memory profile"
                    );
                    Arc::new(ConversationalMemory::new(memory_store.clone(), embedder.clone(), profile))
                }
                None => memory.clone(),
            }
        };

        let travel = agents::travel_agent(
            model.clone(),
            memory_for(agents::TRAVEL_AGENT, None),
            &config.agent_config(agents::TRAVEL_AGENT),
        )
        .with_tools(configured_tools(&config, agents::TRAVEL_AGENT)?);
        let travel = Arc::new(travel);

        let memory_agent = agents::memory_agent(
            model.clone(),
            memory_for(agents::MEMORY_AGENT, None),
            &config.agent_config(agents::MEMORY_AGENT),
        )
        .with_tools(configured_tools(&config, agents::MEMORY_AGENT)?);

        let financial = agents::financial_agent(
            model,
            memory_for(
                agents::FINANCIAL_AGENT,
                Some(agents::financial_memory_profile(&config.memory)),
            ),
            &config.agent_config(agents::FINANCIAL_AGENT),
        )
        .with_tools(configured_tools(&config, agents::FINANCIAL_AGENT)?);

        let mut engine = WorkflowEngine::new(run_store);
        engine.register(workflows::travel_agent_workflow(travel.clone())?);

        let agents = HashMap::from([
            (agents::TRAVEL_AGENT.to_string(), travel),
            (agents::MEMORY_AGENT.to_string(), Arc::new(memory_agent)),
            (agents::FINANCIAL_AGENT.to_string(), Arc::new(financial)),
        ]);

        tracing::info!(
            workflows = ?engine.workflow_ids(),
            agents = ?agents.keys().collect::<Vec<_>>(),
            "Waypoint assembled"
        );

        Ok(Self {
            config,
            pool,
            engine,
            memory,
            agents,
        })
    }

    pub fn agent(&self, name: &str) -> Result<Arc<Agent>, WaypointError> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| WaypointError::AgentNotFound(name.to_string()))
    }

    pub fn agent_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// HTTP tools configured under `[[agents.<name>.tools]]`.
fn configured_tools(config: &WaypointConfig, agent: &str) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    let Some(profile) = config.agent_profile(agent) else {
        return Ok(registry);
    };
    for tool in &profile.tools {
        let schema = tool.input_schema.clone().unwrap_or(Schema::Any);
        let http = HttpTool::new(&tool.name, &tool.description, schema, &tool.url)
            .with_context(|| format!("Failed to build tool {} for {agent}", tool.name))?;
        tracing::info!(agent = agent, tool = %tool.name, url = %tool.url, "HTTP tool registered");
        registry.register(Arc::new(http));
    }
    Ok(registry)
}
