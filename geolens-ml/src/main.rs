//! geolens-ml - Image Geolocation Microservice
//!
//! Multi-strategy location recognition over uploaded images: exact hash
//! match, vector similarity, OCR geocoding, landmark classification, and a
//! learned regression fallback, with continuous retraining from feedback.

use anyhow::Result;
use geolens_ml::config::MlConfig;
use geolens_ml::embedding::{HashEmbedder, RemoteEmbedder};
use geolens_ml::extractors::{LandmarkClient, NominatimGeocoder, OcrClient};
use geolens_ml::fusion::FusionEngine;
use geolens_ml::index::MemoryIndex;
use geolens_ml::learning::{ActiveLearningQueue, ContinuousTrainer, RetrainPolicy};
use geolens_ml::monitor::{ModelRegistry, PredictionMonitor};
use geolens_ml::regressor::LinearRegressor;
use geolens_ml::types::{
    CoordinateRegressor, EmbeddingProvider, Geocoder, LandmarkClassifier, TextExtractor,
    VectorIndex,
};
use geolens_ml::AppState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting geolens-ml (Image Geolocation) microservice");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Root folder: CLI arg > GEOLENS_ROOT > config file > OS default
    let cli_root = std::env::args().nth(1);
    let root_folder = geolens_common::config::resolve_root_folder(cli_root.as_deref(), "GEOLENS_ROOT")
        .map_err(|e| anyhow::anyhow!("Failed to resolve root folder: {}", e))?;
    geolens_common::config::ensure_root_folder(&root_folder)
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;
    info!("Root folder: {}", root_folder.display());

    let config = Arc::new(
        MlConfig::load(&root_folder).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?,
    );
    std::fs::create_dir_all(&config.data_dir)?;
    info!("Data directory: {}", config.data_dir.display());

    let stage_timeout = Duration::from_secs(config.stage_timeout_secs);

    // Embedding provider: remote service when configured, hash-derived
    // fallback otherwise (exact re-submissions still match)
    let embedder: Arc<dyn EmbeddingProvider> = match &config.embedding_url {
        Some(url) => {
            info!(url = %url, "Using remote embedding service");
            Arc::new(
                RemoteEmbedder::new(url.clone(), config.embedding_dim, stage_timeout)
                    .map_err(|e| anyhow::anyhow!("Embedding client init failed: {}", e))?,
            )
        }
        None => {
            warn!("No embedding service configured; using hash-derived embeddings");
            Arc::new(HashEmbedder::new(config.embedding_dim))
        }
    };

    let index: Arc<MemoryIndex> = Arc::new(
        MemoryIndex::load(config.data_dir.join("index.json"))
            .map_err(|e| anyhow::anyhow!("Index load failed: {}", e))?,
    );
    info!("Vector index: {} entries", index.size().await);

    let text_extractor: Option<Arc<dyn TextExtractor>> = match &config.ocr_url {
        Some(url) => Some(Arc::new(
            OcrClient::new(url.clone(), stage_timeout)
                .map_err(|e| anyhow::anyhow!("OCR client init failed: {}", e))?,
        )),
        None => {
            warn!("No OCR service configured; OCR geocoding stage disabled");
            None
        }
    };
    let geocoder: Option<Arc<dyn Geocoder>> = Some(Arc::new(
        NominatimGeocoder::new(
            config.geocoder_url.clone(),
            config.geocode_confidence,
            Duration::from_secs(config.geocode_timeout_secs),
        )
        .map_err(|e| anyhow::anyhow!("Geocoder init failed: {}", e))?,
    ));
    let landmark_classifier: Option<Arc<dyn LandmarkClassifier>> = match &config.landmark_url {
        Some(url) => Some(Arc::new(
            LandmarkClient::new(url.clone(), stage_timeout)
                .map_err(|e| anyhow::anyhow!("Landmark client init failed: {}", e))?,
        )),
        None => {
            warn!("No landmark service configured; landmark stage disabled");
            None
        }
    };

    let regressor: Arc<dyn CoordinateRegressor> = Arc::new(
        LinearRegressor::load(config.data_dir.join("regressor.json"), config.embedding_dim)
            .map_err(|e| anyhow::anyhow!("Regressor load failed: {}", e))?,
    );

    let engine = Arc::new(FusionEngine::new(
        (*config).clone(),
        embedder.clone(),
        index.clone(),
        text_extractor,
        geocoder,
        landmark_classifier,
        regressor.clone(),
    ));

    let queue = Arc::new(
        ActiveLearningQueue::load(
            config.data_dir.join("training_queue.json"),
            RetrainPolicy {
                min_samples: config.min_samples,
                high_priority_trigger: config.high_priority_trigger,
                absolute_floor: config.absolute_floor,
            },
        )
        .map_err(|e| anyhow::anyhow!("Training queue load failed: {}", e))?,
    );
    let registry = Arc::new(
        ModelRegistry::load(config.data_dir.join("models.json"))
            .map_err(|e| anyhow::anyhow!("Model registry load failed: {}", e))?,
    );
    let monitor = Arc::new(PredictionMonitor::new(
        config.data_dir.join("predictions.jsonl"),
    ));
    let trainer = Arc::new(ContinuousTrainer::new(
        config.data_dir.clone(),
        config.min_viable_batch,
        queue.clone(),
        embedder,
        index,
        regressor,
        registry.clone(),
    ));

    // Background loop: periodic retrain check plus degradation-triggered
    // model rollback
    {
        let trainer = trainer.clone();
        let monitor = monitor.clone();
        let registry = registry.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(config.train_check_interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match trainer.run_training_cycle().await {
                    Ok(Some(outcome)) => {
                        info!(version = %outcome.version, samples = outcome.samples_processed, "Background training cycle complete")
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Background training cycle failed"),
                }

                match monitor.calculate_metrics(config.metrics_window_hours).await {
                    Ok(metrics) => {
                        if let Some(mean_error) = metrics.mean_error_km {
                            match registry.auto_select(mean_error, config.degradation_factor).await
                            {
                                Ok(Some(version)) => {
                                    info!(version = %version, "Switched active model after degradation")
                                }
                                Ok(None) => {}
                                Err(e) => warn!(error = %e, "Model auto-select failed"),
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Metrics calculation failed"),
                }
            }
        });
    }

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, engine, queue, trainer, monitor, registry);
    let app = geolens_ml::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{}", bind_addr);
    info!("Health check: http://{}/health", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
