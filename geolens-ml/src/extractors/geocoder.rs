//! Nominatim geocoding client with rate limiting
//!
//! Nominatim's usage policy caps anonymous clients at 1 request/second, so
//! every call waits on a shared rate limiter before hitting the network.
//! The importance score Nominatim returns is not a calibrated confidence;
//! callers apply their own confidence to geocoded results.

use crate::types::{GeocodeResult, Geocoder, StageError};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const NOMINATIM_BASE_URL: &str = "https://nominatim.openstreetmap.org/search";
const USER_AGENT: &str = concat!("geolens/", env!("CARGO_PKG_VERSION"));
const RATE_LIMIT_MS: u64 = 1000; // 1 request per second

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    display_name: String,
}

/// Rate limiter enforcing a minimum interval between requests
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval_ms: u64) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    /// Wait if necessary to comply with rate limit
    async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

pub struct NominatimGeocoder {
    http_client: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
    confidence: f32,
}

impl NominatimGeocoder {
    /// `confidence` is attached to every successful geocode; Nominatim
    /// does not return one.
    pub fn new(base_url: Option<String>, confidence: f32, timeout: Duration) -> Result<Self, StageError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| StageError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.unwrap_or_else(|| NOMINATIM_BASE_URL.to_string()),
            rate_limiter: Arc::new(RateLimiter::new(RATE_LIMIT_MS)),
            confidence,
        })
    }
}

#[async_trait::async_trait]
impl Geocoder for NominatimGeocoder {
    fn name(&self) -> &'static str {
        "nominatim"
    }

    async fn geocode(&self, query: &str) -> Result<Option<GeocodeResult>, StageError> {
        self.rate_limiter.wait().await;

        tracing::debug!(query = %query, "Geocoding");

        let response = self
            .http_client
            .get(&self.base_url)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
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

        let places: Vec<NominatimPlace> = response
            .json()
            .await
            .map_err(|e| StageError::Parse(e.to_string()))?;

        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };

        let latitude: f64 = place
            .lat
            .parse()
            .map_err(|_| StageError::Parse(format!("bad latitude: {}", place.lat)))?;
        let longitude: f64 = place
            .lon
            .parse()
            .map_err(|_| StageError::Parse(format!("bad longitude: {}", place.lon)))?;

        if !geolens_common::geo::is_valid_coordinate(latitude, longitude) {
            return Err(StageError::Parse(format!(
                "out-of-range coordinate: {}, {}",
                latitude, longitude
            )));
        }

        Ok(Some(GeocodeResult {
            latitude,
            longitude,
            formatted_address: place.display_name,
            confidence: self.confidence,
        }))
    }
}
