//! Signal extraction from image content
//!
//! Clients for the OCR and landmark-classification services, the geocoder,
//! and the candidate filter that decides which extracted text fragments are
//! worth geocoding.

pub mod geocoder;
pub mod landmark_client;
pub mod ocr_client;
pub mod text_candidates;

pub use geocoder::NominatimGeocoder;
pub use landmark_client::LandmarkClient;
pub use ocr_client::OcrClient;
pub use text_candidates::select_candidates;
