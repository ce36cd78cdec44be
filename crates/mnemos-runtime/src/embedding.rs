//! Embedding driver for the vector stage.
//!
//! Provides an `EmbeddingDriver` trait and an OpenAI-compatible implementation
//! that works with any provider offering an `/embeddings` endpoint (Voyage,
//! OpenAI, Together, Mistral, Ollama, etc.).

use async_trait::async_trait;
use mnemos_types::config::EmbeddingProviderConfig;
use mnemos_types::error::MnemosError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub const VOYAGE_BASE_URL: &str = "https://api.voyageai.com/v1";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const TOGETHER_BASE_URL: &str = "https://api.together.xyz/v1";
pub const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// Error type for embedding operations.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing API key: {0}")]
    MissingApiKey(String),
}

impl From<EmbeddingError> for MnemosError {
    fn from(e: EmbeddingError) -> Self {
        MnemosError::ProviderUnavailable(e.to_string())
    }
}

/// Resolved settings for one embedding driver.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Provider name (voyage, openai, ollama, etc.).
    pub provider: String,
    /// Model name (e.g., "voyage-3-lite").
    pub model: String,
    /// API key (resolved from env var).
    pub api_key: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Vector dimension produced by the model.
    pub dimensions: usize,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
}

/// Trait for computing text embeddings.
#[async_trait]
pub trait EmbeddingDriver: Send + Sync {
    /// Compute embedding vectors for a batch of texts, in input order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Compute embedding for a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let results = self.embed(&[text]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Parse("Empty embedding response".to_string()))
    }

    /// Return the dimensionality of embeddings produced by this driver.
    fn dimensions(&self) -> usize;
}

/// OpenAI-compatible embedding driver.
pub struct OpenAIEmbeddingDriver {
    api_key: Zeroizing<String>,
    base_url: String,
    model: String,
    client: reqwest::Client,
    dims: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl OpenAIEmbeddingDriver {
    /// Create a new OpenAI-compatible embedding driver.
    pub fn new(config: EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;
        Ok(Self {
            api_key: Zeroizing::new(config.api_key),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model,
            client,
            dims: config.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingDriver for OpenAIEmbeddingDriver {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let url = format!("{}/embeddings", self.base_url);
        let body = EmbedRequest {
            model: &self.model,
            input: texts,
        };

        let mut req = self.client.post(&url).json(&body);
        if !self.api_key.as_str().is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key.as_str()));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;
        let status = resp.status().as_u16();

        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status,
                message: body_text,
            });
        }

        let mut data: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Parse(e.to_string()))?;

        // Providers may return items out of order; `index` restores input order.
        data.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        let embeddings: Vec<Vec<f32>> = data.data.into_iter().map(|d| d.embedding).collect();
        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::Parse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }

        debug!(
            "Embedded {} texts (dims={})",
            embeddings.len(),
            embeddings.first().map(|e| e.len()).unwrap_or(0)
        );

        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

fn provider_base_url(provider: &str) -> String {
    match provider {
        "voyage" => VOYAGE_BASE_URL.to_string(),
        "openai" => OPENAI_BASE_URL.to_string(),
        "together" => TOGETHER_BASE_URL.to_string(),
        "mistral" => MISTRAL_BASE_URL.to_string(),
        "ollama" => OLLAMA_BASE_URL.to_string(),
        other => {
            warn!("Unknown embedding provider '{other}', using OpenAI-compatible format");
            format!("https://{other}/v1")
        }
    }
}

fn is_local(base_url: &str) -> bool {
    base_url.contains("localhost") || base_url.contains("127.0.0.1") || base_url.contains("[::1]")
}

/// Create an embedding driver from the `[embedding]` config section.
///
/// Remote providers require the key named by `api_key_env`; local ones do not.
pub fn create_embedding_driver(
    config: &EmbeddingProviderConfig,
) -> Result<Box<dyn EmbeddingDriver>, EmbeddingError> {
    let api_key = if config.api_key_env.is_empty() {
        String::new()
    } else {
        std::env::var(&config.api_key_env).unwrap_or_default()
    };

    let base_url = config
        .base_url
        .clone()
        .unwrap_or_else(|| provider_base_url(&config.provider));

    if !is_local(&base_url) {
        if api_key.is_empty() {
            return Err(EmbeddingError::MissingApiKey(config.api_key_env.clone()));
        }
        warn!(
            provider = %config.provider,
            base_url = %base_url,
            "Embedding driver configured to send data to external API; query text will leave this machine"
        );
    }

    let driver = OpenAIEmbeddingDriver::new(EmbeddingConfig {
        provider: config.provider.clone(),
        model: config.model.clone(),
        api_key,
        base_url,
        dimensions: config.dimension,
        timeout: Duration::from_secs(config.timeout_secs),
    })?;
    Ok(Box::new(driver))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_base_urls() {
        assert_eq!(provider_base_url("voyage"), VOYAGE_BASE_URL);
        assert_eq!(provider_base_url("ollama"), OLLAMA_BASE_URL);
        assert_eq!(provider_base_url("example.org"), "https://example.org/v1");
    }

    #[test]
    fn test_remote_provider_requires_key() {
        let config = EmbeddingProviderConfig {
            api_key_env: "MNEMOS_TEST_KEY_THAT_IS_NOT_SET".into(),
            ..Default::default()
        };
        let err = create_embedding_driver(&config).err().unwrap();
        assert!(matches!(err, EmbeddingError::MissingApiKey(_)));
        assert!(matches!(MnemosError::from(err), MnemosError::ProviderUnavailable(_)));
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let config = EmbeddingProviderConfig {
            provider: "ollama".into(),
            model: "nomic-embed-text".into(),
            api_key_env: String::new(),
            dimension: 768,
            ..Default::default()
        };
        let driver = create_embedding_driver(&config).unwrap();
        assert_eq!(driver.dimensions(), 768);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let driver = OpenAIEmbeddingDriver::new(EmbeddingConfig {
            provider: "ollama".into(),
            model: "m".into(),
            api_key: String::new(),
            base_url: "http://127.0.0.1:9".into(),
            dimensions: 4,
            timeout: Duration::from_millis(100),
        })
        .unwrap();
        assert!(driver.embed(&[]).await.unwrap().is_empty());
    }
}
