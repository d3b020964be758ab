//! Model registry with degradation-triggered rollback
//!
//! Tracks every regressor version produced by a training cycle along with
//! its training metrics, and records which version is active. When the live
//! mean error drifts past the best registered model's by the configured
//! degradation factor, `auto_select` switches back to the better version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetrics {
    /// Mean training loss of the cycle that produced this version, km
    pub mean_error_km: Option<f64>,
    /// Samples consumed by that cycle
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub version: String,
    pub registered_at: DateTime<Utc>,
    pub metrics: ModelMetrics,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    models: Vec<ModelEntry>,
    active: Option<String>,
}

pub struct ModelRegistry {
    path: PathBuf,
    state: Mutex<RegistryFile>,
}

impl ModelRegistry {
    pub fn load(path: PathBuf) -> Result<Self, geolens_common::Error> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<RegistryFile>(&content) {
                Ok(registry) => registry,
                Err(e) => {
                    let corrupt_path = path.with_extension("json.corrupt");
                    warn!(
                        path = %path.display(),
                        error = %e,
                        moved_to = %corrupt_path.display(),
                        "Model registry malformed; starting empty"
                    );
                    std::fs::rename(&path, &corrupt_path)?;
                    RegistryFile::default()
                }
            }
        } else {
            RegistryFile::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &RegistryFile) -> geolens_common::Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Register a newly trained version. The first registered model becomes
    /// active automatically; later ones must be promoted explicitly or by
    /// `auto_select`.
    pub async fn register_model(
        &self,
        version: String,
        metrics: ModelMetrics,
    ) -> geolens_common::Result<()> {
        let mut state = self.state.lock().await;
        state.models.push(ModelEntry {
            version: version.clone(),
            registered_at: Utc::now(),
            metrics,
        });
        if state.active.is_none() {
            state.active = Some(version.clone());
        }
        self.persist(&state)?;
        info!(version = %version, total = state.models.len(), "Registered model");
        Ok(())
    }

    pub async fn set_active_model(&self, version: &str) -> geolens_common::Result<()> {
        let mut state = self.state.lock().await;
        if !state.models.iter().any(|m| m.version == version) {
            return Err(geolens_common::Error::NotFound(format!(
                "model version {}",
                version
            )));
        }
        state.active = Some(version.to_string());
        self.persist(&state)?;
        info!(version = %version, "Activated model");
        Ok(())
    }

    pub async fn get_active_model(&self) -> Option<ModelEntry> {
        let state = self.state.lock().await;
        let active = state.active.as_ref()?;
        state.models.iter().find(|m| &m.version == active).cloned()
    }

    /// Lowest mean error among registered models
    pub async fn get_best_model(&self) -> Option<ModelEntry> {
        let state = self.state.lock().await;
        state
            .models
            .iter()
            .filter(|m| m.metrics.mean_error_km.is_some())
            .min_by(|a, b| {
                let a_err = a.metrics.mean_error_km.unwrap_or(f64::INFINITY);
                let b_err = b.metrics.mean_error_km.unwrap_or(f64::INFINITY);
                a_err.partial_cmp(&b_err).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    pub async fn list_models(&self) -> Vec<ModelEntry> {
        self.state.lock().await.models.clone()
    }

    /// Switch to the best registered model when the live error has degraded
    /// past `degradation_factor` times its error. Returns the version
    /// switched to, if a switch happened.
    pub async fn auto_select(
        &self,
        current_mean_error_km: f64,
        degradation_factor: f64,
    ) -> geolens_common::Result<Option<String>> {
        let best = match self.get_best_model().await {
            Some(best) => best,
            None => return Ok(None),
        };
        let Some(best_error) = best.metrics.mean_error_km else {
            return Ok(None);
        };

        let active_version = {
            let state = self.state.lock().await;
            state.active.clone()
        };
        if active_version.as_deref() == Some(best.version.as_str()) {
            return Ok(None);
        }

        if current_mean_error_km > best_error * degradation_factor {
            warn!(
                current_error_km = current_mean_error_km,
                best_error_km = best_error,
                version = %best.version,
                "Live error degraded; switching to best registered model"
            );
            self.set_active_model(&best.version).await?;
            return Ok(Some(best.version));
        }
        Ok(None)
    }
}
