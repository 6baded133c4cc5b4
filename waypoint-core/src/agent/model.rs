//! Language model capability.
//!
//! The model is a black box: messages (and optionally an output schema and
//! tool specs) in, text / structured object / tool calls out. `HttpModelClient`
//! speaks a neutral JSON contract, `ScriptedModel` replays canned responses.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::models::NewMessage;
use crate::schema::Schema;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Missing model endpoint")]
    MissingEndpoint,

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },

    #[error("Scripted model has no responses left")]
    ScriptExhausted,
}

/// Tool description handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelRequest {
    pub messages: Vec<NewMessage>,
    pub output_schema: Option<Schema>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub object: Option<Value>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn object(object: Value) -> Self {
        Self {
            text: object.to_string(),
            object: Some(object),
            ..Self::default()
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_calls: vec![ToolCall {
                id: None,
                name: name.into(),
                arguments,
            }],
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;

    fn name(&self) -> &str;
}

// ============================================================================
// HttpModelClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpModelConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub timeout_seconds: u64,
}

impl HttpModelConfig {
    pub fn from_config(config: &crate::config::ModelConfig) -> Result<Self, ModelError> {
        let endpoint = config
            .endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or(ModelError::MissingEndpoint)?;

        Ok(Self {
            endpoint,
            api_key: std::env::var("WAYPOINT_MODEL_API_KEY").ok(),
            model: config.model.clone(),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            timeout_seconds: config.timeout_seconds,
        })
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: Value,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_schema: Option<Value>,
    #[serde(skip_serializing_if = "<[ToolSpec]>::is_empty")]
    tools: &'a [ToolSpec],
}

/// `POST {endpoint}/generate` with retry and exponential backoff.
#[derive(Debug, Clone)]
pub struct HttpModelClient {
    client: Client,
    config: HttpModelConfig,
}

impl HttpModelClient {
    pub fn new(config: HttpModelConfig) -> Result<Self, ModelError> {
        if config.endpoint.is_empty() {
            return Err(ModelError::MissingEndpoint);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }

    async fn generate_once(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/generate", self.config.endpoint.trim_end_matches('/'));

        let body = GenerateRequest {
            model: &self.config.model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: match &m.content {
                        crate::models::MessageContent::Text(t) => Value::String(t.clone()),
                        crate::models::MessageContent::Structured(v) => v.clone(),
                    },
                })
                .collect(),
            output_schema: request.output_schema.as_ref().map(Schema::describe),
            tools: &request.tools,
        };

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::error!(code = status.as_u16(), message = %message, "Model API error");
            return Err(ModelError::Api {
                code: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<ModelResponse>().await?)
    }
}

#[async_trait]
impl LanguageModel for HttpModelClient {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        Retry::spawn(retry_strategy, || self.generate_once(&request))
            .await
            .map_err(|e| {
                tracing::error!(
                    attempts = self.config.max_retries,
                    error = %e,
                    "All model retry attempts failed"
                );
                ModelError::RetryExhausted {
                    attempts: self.config.max_retries,
                }
            })
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// ScriptedModel
// ============================================================================

/// Replays queued responses in order and records every request it saw.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<ModelResponse>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub async fn push(&self, response: ModelResponse) {
        self.responses.lock().await.push_back(response);
    }

    pub async fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests.lock().await.push(request);
        self.responses
            .lock()
            .await
            .pop_front()
            .ok_or(ModelError::ScriptExhausted)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
