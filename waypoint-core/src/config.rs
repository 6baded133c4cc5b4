use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::models::WorkingMemoryFormat;
use crate::schema::Schema;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WaypointConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Per-agent overrides, keyed by agent name (`[agents.financialAgent]`).
    #[serde(default)]
    pub agents: HashMap<String, AgentProfileConfig>,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/waypoint.sock".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `http`, `http-fallback` or `hash`.
    pub backend: String,
    pub endpoint: Option<String>,
    pub model: String,
    pub dimensions: u32,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: "hash".to_string(),
            endpoint: None,
            model: "text-embedding-small".to_string(),
            dimensions: 384,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub endpoint: Option<String>,
    pub model: String,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: "default".to_string(),
            max_retries: 3,
            retry_delay_ms: 1000,
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    pub last_messages: usize,
    pub token_limit: usize,
    #[serde(default)]
    pub generate_titles: bool,
    #[serde(default)]
    pub semantic_recall: SemanticRecallConfig,
    #[serde(default)]
    pub working_memory: WorkingMemoryConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            last_messages: 20,
            token_limit: 120_000,
            generate_titles: false,
            semantic_recall: SemanticRecallConfig::default(),
            working_memory: WorkingMemoryConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecallScope {
    /// Search every thread owned by the resource.
    #[default]
    Resource,
    /// Search only the current thread.
    Thread,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SemanticRecallConfig {
    pub enabled: bool,
    pub top_k: usize,
    pub before: usize,
    pub after: usize,
    #[serde(default)]
    pub scope: RecallScope,
}

impl Default for SemanticRecallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 3,
            before: 2,
            after: 1,
            scope: RecallScope::Resource,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkingMemoryConfig {
    pub enabled: bool,
    #[serde(default)]
    pub format: WorkingMemoryFormat,
    /// Seed document. Defaults by format: the user profile for markdown, `{}` for json.
    #[serde(default)]
    pub template: Option<String>,
    /// Shape every merged json document must keep. Ignored for markdown.
    #[serde(default)]
    pub schema: Option<Schema>,
}

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: WorkingMemoryFormat::Markdown,
            template: None,
            schema: None,
        }
    }
}

impl WorkingMemoryConfig {
    pub fn template(&self) -> &str {
        match (&self.template, self.format) {
            (Some(template), _) => template.as_str(),
            (None, WorkingMemoryFormat::Markdown) => DEFAULT_TEMPLATE,
            (None, WorkingMemoryFormat::Json) => "{}",
        }
    }
}

/// User profile layout seeded into every new resource.
pub const DEFAULT_TEMPLATE: &str = "# USER PROFILE

## PERSONAL INFO
- name:
- location:

## PREFERENCES
- travel preferences:
- accommodation preferences:
- conversation style:

## INTERESTS
- likes:
- dislikes:
";

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Upper bound on model calls per `generate` when tools are requested.
    pub max_steps: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { max_steps: 5 }
    }
}

/// Overrides for one named agent. Unset fields fall back to the agent's
/// built-in profile and then to the top-level sections.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AgentProfileConfig {
    pub max_steps: Option<usize>,
    /// Replaces the agent's memory profile wholesale.
    pub memory: Option<MemoryConfig>,
    pub tools: Vec<HttpToolConfig>,
}

/// A remote tool: JSON input is POSTed to `url`, the JSON reply is the result.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub input_schema: Option<Schema>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8767,
        }
    }
}

impl WaypointConfig {
    /// Load from a TOML file, with `WAYPOINT__SECTION__KEY` env overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("WAYPOINT").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// Overrides for `name`. Matched case-insensitively since config keys may
    /// arrive lowercased.
    pub fn agent_profile(&self, name: &str) -> Option<&AgentProfileConfig> {
        self.agents
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, profile)| profile)
    }

    /// Effective agent settings for `name`.
    pub fn agent_config(&self, name: &str) -> AgentConfig {
        match self.agent_profile(name).and_then(|p| p.max_steps) {
            Some(max_steps) => AgentConfig { max_steps },
            None => self.agent.clone(),
        }
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        s.try_deserialize()
    }
}
