//! HTTP API handlers for geolens-ml

pub mod feedback;
pub mod health;
pub mod predict;
pub mod stats;

pub use feedback::feedback_routes;
pub use health::health_routes;
pub use predict::predict_routes;
pub use stats::stats_routes;
