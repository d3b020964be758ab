//! Embedding providers
//!
//! Two implementations of the `EmbeddingProvider` seam: a remote client for
//! a CLIP-style encoding service, and a deterministic hash-derived provider
//! used when no service is configured (exact re-submissions still match,
//! and tests get reproducible vectors).

pub mod hash_embedder;
pub mod remote_embedder;

pub use hash_embedder::HashEmbedder;
pub use remote_embedder::RemoteEmbedder;
