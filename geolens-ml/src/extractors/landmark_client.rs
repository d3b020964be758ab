//! Landmark classification service client
//!
//! Posts image bytes to a landmark-recognition service and expects a JSON
//! body `{"predictions": [{"class_id": ..., "class_name": ..., "confidence": ...}]}`
//! ordered by descending confidence.

use crate::types::{LandmarkClassifier, LandmarkPrediction, StageError};
use serde::Deserialize;
use std::time::Duration;

const USER_AGENT: &str = concat!("geolens/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct LandmarkResponse {
    predictions: Vec<LandmarkEntry>,
}

#[derive(Debug, Deserialize)]
struct LandmarkEntry {
    class_id: u32,
    class_name: String,
    confidence: f32,
}

pub struct LandmarkClient {
    http_client: reqwest::Client,
    url: String,
}

impl LandmarkClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, StageError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| StageError::Network(e.to_string()))?;

        Ok(Self { http_client, url })
    }
}

#[async_trait::async_trait]
impl LandmarkClassifier for LandmarkClient {
    fn name(&self) -> &'static str {
        "landmark"
    }

    async fn classify(
        &self,
        image_bytes: &[u8],
        top_k: usize,
    ) -> Result<Vec<LandmarkPrediction>, StageError> {
        tracing::debug!(url = %self.url, bytes = image_bytes.len(), "Requesting landmark classification");

        let response = self
            .http_client
            .post(&self.url)
            .query(&[("top_k", top_k.to_string())])
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

        let body: LandmarkResponse = response
            .json()
            .await
            .map_err(|e| StageError::Parse(e.to_string()))?;

        let mut predictions: Vec<LandmarkPrediction> = body
            .predictions
            .into_iter()
            .map(|p| LandmarkPrediction {
                class_id: p.class_id,
                class_name: p.class_name,
                confidence: p.confidence,
            })
            .collect();

        // Service promises descending order; enforce it anyway
        predictions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        predictions.truncate(top_k);
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = LandmarkClient::new(
            "http://localhost:9002/classify".to_string(),
            Duration::from_secs(10),
        );
        assert!(client.is_ok());
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{"predictions": [{"class_id": 412, "class_name": "National Theatre Lagos", "confidence": 0.87}]}"#;
        let parsed: LandmarkResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.predictions.len(), 1);
        assert_eq!(parsed.predictions[0].class_id, 412);
    }
}
