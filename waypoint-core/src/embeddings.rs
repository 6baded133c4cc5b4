//! Embeddings module for Waypoint: pluggable text → vector backends
//!
//! Provides an `EmbeddingBackend` trait with implementations for:
//! - **HTTP**: a remote embedding service speaking a small JSON contract
//! - **HTTP-fallback**: HTTP with graceful degradation to `Ok(None)`
//! - **Hash**: deterministic local feature hashing, no network required

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

/// Default dimensions for the local hashing embedder
pub const HASH_DIMENSIONS: usize = 384;

// ============================================================================
// EmbeddingBackend trait
// ============================================================================

/// Abstraction over embedding providers.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed a single text. Returns `None` if embedding is unavailable
    /// (used in fallback mode to signal graceful degradation).
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError>;

    /// Embed a recall query. Backends that distinguish query and document
    /// embeddings override this. Defaults to calling `embed()`.
    async fn embed_query(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        self.embed(text).await
    }

    /// Returns the embedding dimension.
    fn dimensions(&self) -> usize;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

/// Task hint sent to the embedding service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Document,
    Query,
}

/// Embedding generation errors
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response: expected {expected} dimensions, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },

    #[error("Missing embedding endpoint")]
    MissingEndpoint,

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },
}

// ============================================================================
// Config types
// ============================================================================

/// HTTP embedding client configuration
#[derive(Debug, Clone)]
pub struct HttpEmbeddingConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl HttpEmbeddingConfig {
    pub fn from_config(config: &crate::config::EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let endpoint = config
            .endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or(EmbeddingError::MissingEndpoint)?;

        Ok(Self {
            endpoint,
            api_key: std::env::var("WAYPOINT_EMBEDDING_API_KEY").ok(),
            model: config.model.clone(),
            dimensions: config.dimensions as usize,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }
}

/// Configuration union for the backend factory.
pub enum BackendConfig {
    Http(HttpEmbeddingConfig),
    HttpFallback(HttpEmbeddingConfig),
    Hash { dimensions: usize },
}

impl BackendConfig {
    /// Select a backend from the `[embedding]` section.
    pub fn from_config(config: &crate::config::EmbeddingConfig) -> Result<Self, EmbeddingError> {
        match config.backend.as_str() {
            "http" => Ok(BackendConfig::Http(HttpEmbeddingConfig::from_config(config)?)),
            "http-fallback" => Ok(BackendConfig::HttpFallback(
                HttpEmbeddingConfig::from_config(config)?,
            )),
            _ => Ok(BackendConfig::Hash {
                dimensions: config.dimensions as usize,
            }),
        }
    }
}

/// Create the appropriate backend from configuration.
pub fn create_backend(config: BackendConfig) -> Result<Box<dyn EmbeddingBackend>, EmbeddingError> {
    match config {
        BackendConfig::Http(c) => Ok(Box::new(HttpEmbeddingClient::new(c)?)),
        BackendConfig::HttpFallback(c) => Ok(Box::new(FallbackEmbeddingClient::new(c)?)),
        BackendConfig::Hash { dimensions } => Ok(Box::new(HashEmbedder::new(dimensions))),
    }
}

// ============================================================================
// Wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
    task: TaskType,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: u16,
    message: String,
}

// ============================================================================
// HttpEmbeddingClient
// ============================================================================

/// Embedding client for a remote service: `POST {endpoint}/embed`.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingClient {
    client: Client,
    config: HttpEmbeddingConfig,
}

impl HttpEmbeddingClient {
    pub fn new(config: HttpEmbeddingConfig) -> Result<Self, EmbeddingError> {
        if config.endpoint.is_empty() {
            return Err(EmbeddingError::MissingEndpoint);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, config })
    }

    /// Generate an embedding with a specific task type
    pub async fn embed_with_task(
        &self,
        text: &str,
        task: TaskType,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = Retry::spawn(retry_strategy, || self.embed_once(text, task)).await;

        match result {
            Ok(vec) => Ok(vec),
            Err(e) => {
                tracing::error!(
                    attempts = self.config.max_retries,
                    error = %e,
                    "All embedding retry attempts failed"
                );
                Err(EmbeddingError::RetryExhausted {
                    attempts: self.config.max_retries,
                })
            }
        }
    }

    async fn embed_once(&self, text: &str, task: TaskType) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/embed", self.config.endpoint.trim_end_matches('/'));

        let request = EmbedRequest {
            model: &self.config.model,
            input: text,
            task,
            dimensions: self.config.dimensions,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let error_detail = serde_json::from_str::<ErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error);

            let (code, message) = error_detail
                .map(|e| (e.code, e.message))
                .unwrap_or((status.as_u16(), error_body));

            tracing::error!(code = code, message = %message, "Embedding API error");

            return Err(EmbeddingError::Api { code, message });
        }

        let values = response.json::<EmbedResponse>().await?.embedding;

        if values.len() != self.config.dimensions {
            return Err(EmbeddingError::InvalidDimensions {
                expected: self.config.dimensions,
                actual: values.len(),
            });
        }

        Ok(values)
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        self.embed_with_task(text, TaskType::Document).await.map(Some)
    }

    async fn embed_query(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        self.embed_with_task(text, TaskType::Query).await.map(Some)
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ============================================================================
// FallbackEmbeddingClient
// ============================================================================

/// Wraps `HttpEmbeddingClient`. On any error, logs a warning and returns
/// `Ok(None)` so the message is stored without a recall index entry.
pub struct FallbackEmbeddingClient {
    inner: HttpEmbeddingClient,
}

impl FallbackEmbeddingClient {
    pub fn new(config: HttpEmbeddingConfig) -> Result<Self, EmbeddingError> {
        Ok(Self {
            inner: HttpEmbeddingClient::new(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for FallbackEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        match self.inner.embed_with_task(text, TaskType::Document).await {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                tracing::warn!(error = %e, "Embedding failed, message stored without recall entry");
                Ok(None)
            }
        }
    }

    async fn embed_query(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        match self.inner.embed_with_task(text, TaskType::Query).await {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                tracing::warn!(error = %e, "Query embedding failed, semantic recall skipped");
                Ok(None)
            }
        }
    }

    fn dimensions(&self) -> usize {
        self.inner.config.dimensions
    }

    fn name(&self) -> &str {
        "http-fallback"
    }
}

// ============================================================================
// HashEmbedder
// ============================================================================

/// Deterministic bag-of-words embedder using signed feature hashing.
///
/// Vectors are L2-normalized, so cosine similarity reduces to a dot product
/// and texts sharing vocabulary land close together.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        for token in &tokens {
            let h = fnv1a(token.as_bytes());
            let index = (h % self.dimensions as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingBackend for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        Ok(Some(self.embed_sync(text)))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hash"
    }
}

/// Cosine similarity; 0.0 when either vector is empty or zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(endpoint: String) -> HttpEmbeddingConfig {
        HttpEmbeddingConfig {
            endpoint,
            api_key: Some("test-api-key".to_string()),
            model: "text-embedding-small".to_string(),
            dimensions: 8,
            max_retries: 3,
            retry_delay_ms: 10,
        }
    }

    fn mock_embedding_response() -> serde_json::Value {
        let values: Vec<f32> = (0..8).map(|i| (i as f32) / 8.0).collect();
        serde_json::json!({ "embedding": values })
    }

    #[tokio::test]
    async fn test_embed_calls_api_and_returns_vector() {
        let mock_server = MockServer::start().await;
        let client = HttpEmbeddingClient::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .and(path("/embed"))
            .and(header("authorization", "Bearer test-api-key"))
            .and(body_json(serde_json::json!({
                "model": "text-embedding-small",
                "input": "hello world",
                "task": "document",
                "dimensions": 8
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_embedding_response()))
            .mount(&mock_server)
            .await;

        let embedding = client.embed("hello world").await.unwrap().unwrap();
        assert_eq!(embedding.len(), 8);
    }

    #[tokio::test]
    async fn test_embed_query_sends_query_task() {
        let mock_server = MockServer::start().await;
        let client = HttpEmbeddingClient::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_embedding_response()))
            .mount(&mock_server)
            .await;

        client.embed_query("what did we discuss").await.unwrap();

        let received = mock_server.received_requests().await.unwrap_or_default();
        let body = String::from_utf8_lossy(&received.last().unwrap().body).to_string();
        assert!(body.contains("\"task\":\"query\""), "got: {}", body);
    }

    #[tokio::test]
    async fn test_embed_returns_retry_exhausted_on_500() {
        let mock_server = MockServer::start().await;
        let client = HttpEmbeddingClient::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "code": 500, "message": "Internal server error" }
            })))
            .mount(&mock_server)
            .await;

        match client.embed("hello").await {
            Err(EmbeddingError::RetryExhausted { attempts }) => assert_eq!(attempts, 3),
            other => panic!("Expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_embed_retries_on_429_then_succeeds() {
        let mock_server = MockServer::start().await;
        let client = HttpEmbeddingClient::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": { "code": 429, "message": "Rate limit exceeded" }
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_embedding_response()))
            .mount(&mock_server)
            .await;

        let embedding = client.embed("hello").await.unwrap().unwrap();
        assert_eq!(embedding.len(), 8);
    }

    #[test]
    fn test_missing_endpoint_is_rejected() {
        let result = HttpEmbeddingClient::new(test_config(String::new()));
        assert!(matches!(result, Err(EmbeddingError::MissingEndpoint)));
    }

    #[tokio::test]
    async fn test_wrong_dimensions_are_rejected() {
        let mock_server = MockServer::start().await;
        let mut config = test_config(mock_server.uri());
        config.max_retries = 0;
        let client = HttpEmbeddingClient::new(config).unwrap();

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "embedding": [0.1, 0.2, 0.3] })),
            )
            .mount(&mock_server)
            .await;

        assert!(client.embed("hello").await.is_err());
    }

    #[tokio::test]
    async fn test_fallback_returns_none_on_error() {
        let mock_server = MockServer::start().await;
        let mut config = test_config(mock_server.uri());
        config.max_retries = 1;
        let fallback = FallbackEmbeddingClient::new(config).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "code": 500, "message": "boom" }
            })))
            .mount(&mock_server)
            .await;

        let result = fallback.embed("hello").await;
        assert!(result.unwrap().is_none(), "Fallback should return None on error");
        assert_eq!(fallback.name(), "http-fallback");
    }

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("street food in Tokyo").await.unwrap().unwrap();
        let b = embedder.embed("street food in Tokyo").await.unwrap().unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_ranks_shared_vocabulary_higher() {
        let embedder = HashEmbedder::new(HASH_DIMENSIONS);
        let query = embedder.embed_sync("ramen restaurants in Tokyo");
        let related = embedder.embed_sync("best ramen in Tokyo");
        let unrelated = embedder.embed_sync("quarterly budget spreadsheet");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_backend_selection_from_config() {
        let mut config = crate::config::EmbeddingConfig::default();
        assert!(matches!(
            BackendConfig::from_config(&config),
            Ok(BackendConfig::Hash { dimensions: 384 })
        ));

        config.backend = "http".to_string();
        assert!(matches!(
            BackendConfig::from_config(&config),
            Err(EmbeddingError::MissingEndpoint)
        ));
    }
}
