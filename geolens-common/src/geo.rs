//! Geographic primitives: coordinate validation and great-circle distance
//!
//! Distance error is always reported in kilometers of great-circle
//! (haversine) distance. Degree-space Euclidean distance misrepresents
//! physical error near the poles and across the antimeridian, so nothing
//! in geolens compares raw degree deltas.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometers
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 coordinate pair (degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a point, returning None when either component is out of range
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        if is_valid_coordinate(latitude, longitude) {
            Some(Self {
                latitude,
                longitude,
            })
        } else {
            None
        }
    }
}

/// True when both components are finite and within WGS84 ranges
pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// Great-circle distance between two points in kilometers
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * c
}
