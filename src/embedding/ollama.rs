//! Ollama embedding provider
//!
//! source: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-embeddings
//!
//! Calls are single-shot: transport failures, timeouts, 5xx and 429 come
//! back as [`RagError::Transient`] and the caller decides whether to retry.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::error::{RagError, RagResult};

const SERVICE: &str = "ollama";

#[derive(Debug, Clone)]
pub struct OllamaEmbedding {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    truncate: bool,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct OllamaError {
    error: String,
}

impl OllamaEmbedding {
    pub fn new(config: &EmbeddingConfig) -> RagResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::dependency(SERVICE, "empty embeddings response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let request = EmbedRequest {
            model: &self.model,
            input: texts,
            truncate: true,
        };

        let response = self
            .client
            .post(self.endpoint("/api/embed"))
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::from_reqwest(SERVICE, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RagError::from_reqwest(SERVICE, e))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<OllamaError>(&body) {
                return Err(RagError::from_status(SERVICE, status, &error.error));
            }
            return Err(RagError::from_status(SERVICE, status, &body));
        }

        let parsed: EmbedResponse = serde_json::from_str(&body)
            .map_err(|e| RagError::dependency(SERVICE, format!("malformed response: {}", e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(RagError::dependency(
                SERVICE,
                format!(
                    "requested {} embeddings, received {}",
                    texts.len(),
                    parsed.embeddings.len()
                ),
            ));
        }

        tracing::debug!("Embedded {} texts with {}", texts.len(), self.model);
        Ok(parsed.embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }

    async fn health(&self) -> RagResult<()> {
        let response = self
            .client
            .get(self.endpoint("/api/tags"))
            .send()
            .await
            .map_err(|e| RagError::from_reqwest(SERVICE, e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RagError::from_status(SERVICE, status, ""))
        }
    }
}
