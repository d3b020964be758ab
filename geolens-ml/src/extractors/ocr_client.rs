//! OCR service client
//!
//! Posts image bytes to a text-extraction service and expects a JSON body
//! `{"texts": [{"text": ..., "confidence": ..., "bbox": [x1, y1, x2, y2]}]}`.
//! Fragment filtering happens downstream in `text_candidates`; this client
//! returns everything the service saw.

use crate::types::{StageError, TextExtractor, TextFragment};
use serde::Deserialize;
use std::time::Duration;

const USER_AGENT: &str = concat!("geolens/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct OcrResponse {
    texts: Vec<OcrText>,
}

#[derive(Debug, Deserialize)]
struct OcrText {
    text: String,
    confidence: f32,
    bbox: Option<[f32; 4]>,
}

pub struct OcrClient {
    http_client: reqwest::Client,
    url: String,
}

impl OcrClient {
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
impl TextExtractor for OcrClient {
    fn name(&self) -> &'static str {
        "ocr"
    }

    async fn extract(&self, image_bytes: &[u8]) -> Result<Vec<TextFragment>, StageError> {
        tracing::debug!(url = %self.url, bytes = image_bytes.len(), "Requesting OCR");

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

        let body: OcrResponse = response
            .json()
            .await
            .map_err(|e| StageError::Parse(e.to_string()))?;

        Ok(body
            .texts
            .into_iter()
            .map(|t| TextFragment {
                text: t.text,
                confidence: t.confidence,
                bbox: t.bbox,
            })
            .collect())
    }
}
