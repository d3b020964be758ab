//! HTTP API integration tests
//!
//! Exercises the router end to end with a hash embedder, an in-process
//! index, and no remote collaborators (OCR, landmark, geocoding disabled).

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use geolens_ml::config::MlConfig;
use geolens_ml::embedding::HashEmbedder;
use geolens_ml::fusion::FusionEngine;
use geolens_ml::index::MemoryIndex;
use geolens_ml::learning::{ActiveLearningQueue, ContinuousTrainer, RetrainPolicy};
use geolens_ml::monitor::{ModelRegistry, PredictionMonitor};
use geolens_ml::regressor::LinearRegressor;
use geolens_ml::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

const BOUNDARY: &str = "geolens-test-boundary";

fn test_state(dir: &tempfile::TempDir) -> AppState {
    let data_dir = dir.path().to_path_buf();
    let config = Arc::new(MlConfig {
        data_dir: data_dir.clone(),
        embedding_dim: 64,
        ..MlConfig::default()
    });

    let embedder = Arc::new(HashEmbedder::new(config.embedding_dim));
    let index = Arc::new(MemoryIndex::load(data_dir.join("index.json")).unwrap());
    let regressor = Arc::new(
        LinearRegressor::load(data_dir.join("regressor.json"), config.embedding_dim).unwrap(),
    );
    let engine = Arc::new(FusionEngine::new(
        (*config).clone(),
        embedder.clone(),
        index.clone(),
        None,
        None,
        None,
        regressor.clone(),
    ));
    let queue = Arc::new(
        ActiveLearningQueue::load(
            data_dir.join("training_queue.json"),
            RetrainPolicy {
                min_samples: config.min_samples,
                high_priority_trigger: config.high_priority_trigger,
                absolute_floor: config.absolute_floor,
            },
        )
        .unwrap(),
    );
    let registry = Arc::new(ModelRegistry::load(data_dir.join("models.json")).unwrap());
    let monitor = Arc::new(PredictionMonitor::new(data_dir.join("predictions.jsonl")));
    let trainer = Arc::new(ContinuousTrainer::new(
        data_dir,
        config.min_viable_batch,
        queue.clone(),
        embedder,
        index,
        regressor,
        registry.clone(),
    ));

    AppState::new(config, engine, queue, trainer, monitor, registry)
}

/// Minimal valid PNG for upload tests
fn tiny_png() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(2, 2, image::Rgb([120, 180, 60]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageOutputFormat::Png,
        )
        .unwrap();
    bytes
}

fn multipart_body(text_fields: &[(&str, &str)], file: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in text_fields {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    if let Some(file_bytes) = file {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"img.png\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        body.extend_from_slice(file_bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_reports_degraded_without_collaborators() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(test_state(&dir));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["module"], "geolens-ml");
    // No OCR or landmark service wired up in this fixture
    assert_eq!(body["status"], "degraded");
    assert!(body["uptime_seconds"].is_number());
}

#[tokio::test]
async fn test_stats_empty_service() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(test_state(&dir));

    let response = app
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["index_size"], 0);
    assert_eq!(body["queue_size"], 0);
    assert_eq!(body["should_retrain"], false);
    assert_eq!(body["embedder"], "hash");
    assert_eq!(body["ocr_available"], false);
}

#[tokio::test]
async fn test_predict_requires_file() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(test_state(&dir));

    let body = multipart_body(&[("image_id", "abc")], None);
    let response = app.oneshot(multipart_request("/predict", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_predict_rejects_non_image() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(test_state(&dir));

    let body = multipart_body(&[], Some(b"definitely not an image"));
    let response = app.oneshot(multipart_request("/predict", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_predict_unknown_image_falls_back_to_model() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(test_state(&dir));

    let body = multipart_body(&[], Some(&tiny_png()));
    let response = app.oneshot(multipart_request("/predict", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    // Untrained regressor still answers, at its configured low confidence
    assert_eq!(body["method"], "geolocation_model");
    assert!(body["latitude"].is_number());
    let confidence = body["confidence"].as_f64().unwrap();
    assert!(confidence < 0.5);
}

#[tokio::test]
async fn test_train_then_predict_is_exact_match() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let png = tiny_png();

    let body = multipart_body(
        &[
            ("latitude", "6.5244"),
            ("longitude", "3.3792"),
            ("businessName", "Mega Plaza"),
        ],
        Some(&png),
    );
    let response = build_router(state.clone())
        .oneshot(multipart_request("/train", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let train_body = json_body(response).await;
    assert_eq!(train_body["success"], true);
    assert!(train_body["image_id"].as_str().unwrap().starts_with("loc_"));

    let body = multipart_body(&[], Some(&png));
    let response = build_router(state)
        .oneshot(multipart_request("/predict", body))
        .await
        .unwrap();
    let predict_body = json_body(response).await;
    assert_eq!(predict_body["method"], "exact_match");
    assert_eq!(predict_body["confidence"], 1.0);
    assert_eq!(predict_body["latitude"], 6.5244);
}

#[tokio::test]
async fn test_feedback_rejects_out_of_range_coordinates() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(test_state(&dir));

    let body = multipart_body(
        &[("latitude", "95.0"), ("longitude", "3.0")],
        Some(&tiny_png()),
    );
    let response = app.oneshot(multipart_request("/feedback", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_feedback_queues_high_priority_sample() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let body = multipart_body(
        &[("latitude", "6.5244"), ("longitude", "3.3792")],
        Some(&tiny_png()),
    );
    let response = build_router(state.clone())
        .oneshot(multipart_request("/feedback", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["queue_size"], 1);
    assert_eq!(body["should_retrain"], false);

    let response = build_router(state)
        .oneshot(
            Request::builder()
                .uri("/training_queue")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let queue_body = json_body(response).await;
    assert_eq!(queue_body["total_samples"], 1);
    assert_eq!(queue_body["valid_samples"][0]["priority"], "high");
    assert_eq!(queue_body["valid_samples"][0]["metadata"]["correction"], true);
}

#[tokio::test]
async fn test_trigger_training_below_threshold_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(test_state(&dir));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/trigger_training")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["trained"], false);
}

#[tokio::test]
async fn test_feedback_until_retrain_then_train_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    // Five distinct valid samples hit the min_samples trigger
    for i in 0..5 {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([i as u8 * 40, 10, 200]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageOutputFormat::Png)
            .unwrap();

        let body = multipart_body(
            &[
                ("latitude", &format!("{}", 6.0 + i as f64 * 0.1)),
                ("longitude", "3.3792"),
            ],
            Some(&png),
        );
        let response = build_router(state.clone())
            .oneshot(multipart_request("/feedback", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = build_router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/trigger_training")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["trained"], true);
    assert_eq!(body["samples_processed"], 5);
    assert!(body["version"].as_str().unwrap().starts_with("active_"));

    // Queue drained, index grew, model registered
    let response = build_router(state)
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let stats = json_body(response).await;
    assert_eq!(stats["queue_size"], 0);
    assert_eq!(stats["index_size"], 5);
    assert_eq!(stats["models_registered"], 1);
    assert!(stats["active_model"].as_str().unwrap().starts_with("active_"));
}

#[tokio::test]
async fn test_metrics_endpoint_empty() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(test_state(&dir));

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["total_predictions"], 0);
    assert!(body["mean_error_km"].is_null());
}
