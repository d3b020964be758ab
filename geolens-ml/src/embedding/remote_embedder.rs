//! Remote embedding service client
//!
//! Posts image bytes to a CLIP-style encoding service and expects a JSON
//! body `{"embedding": [f32; dim]}`. The service is trusted to return
//! vectors of the agreed dimension; mismatches are rejected here rather
//! than poisoning the index.

use crate::types::{Embedding, EmbeddingProvider, StageError};
use serde::Deserialize;
use std::time::Duration;

const USER_AGENT: &str = concat!("geolens/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

pub struct RemoteEmbedder {
    http_client: reqwest::Client,
    url: String,
    dimension: usize,
}

impl RemoteEmbedder {
    pub fn new(url: String, dimension: usize, timeout: Duration) -> Result<Self, StageError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| StageError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            url,
            dimension,
        })
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for RemoteEmbedder {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, image_bytes: &[u8]) -> Result<Embedding, StageError> {
        tracing::debug!(url = %self.url, bytes = image_bytes.len(), "Requesting embedding");

        let response = self
            .http_client
            .post(&self.url)
            .header("content-type", "application/octet-stream")
            .body(image_bytes.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StageError::Timeout
                } else {
                    StageError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(StageError::Api(status.as_u16(), error_text));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| StageError::Parse(e.to_string()))?;

        if body.embedding.len() != self.dimension {
            return Err(StageError::Parse(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                body.embedding.len()
            )));
        }

        Ok(Embedding::new(body.embedding))
    }
}
