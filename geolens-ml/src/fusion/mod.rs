//! Multi-strategy location fusion
//!
//! Orders the recognition strategies from cheapest and most certain to most
//! speculative, and returns the first that produces coordinates.

pub mod engine;

pub use engine::FusionEngine;
