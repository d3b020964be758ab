//! Shared types and utilities for the geolens services

pub mod config;
pub mod error;
pub mod geo;

pub use error::{Error, Result};
