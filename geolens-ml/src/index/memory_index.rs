//! In-process vector index with JSON persistence
//!
//! Brute-force cosine search over normalized embeddings (inner product),
//! equivalent to a flat inner-product index. Entries persist to a JSON file
//! in the data directory via write-temp-then-rename, so a crash mid-write
//! leaves the previous snapshot intact.
//!
//! The index is append-only apart from exact-hash dedup: upserting an
//! existing id overwrites that entry. No eviction policy is applied.

use crate::types::{Embedding, IndexMatch, IndexedLocation, LocationRecord, StageError, VectorIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    embedding: Vec<f32>,
    record: LocationRecord,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexSnapshot {
    entries: HashMap<String, StoredEntry>,
}

pub struct MemoryIndex {
    path: PathBuf,
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl MemoryIndex {
    /// Load the index from `path`, starting empty when the file is missing.
    ///
    /// A malformed file is renamed aside (`.corrupt`) and the index starts
    /// empty; the snapshot is kept on disk for manual recovery.
    pub fn load(path: PathBuf) -> Result<Self, geolens_common::Error> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<IndexSnapshot>(&content) {
                Ok(snapshot) => {
                    info!(
                        path = %path.display(),
                        entries = snapshot.entries.len(),
                        "Loaded vector index"
                    );
                    snapshot.entries
                }
                Err(e) => {
                    let corrupt_path = path.with_extension("json.corrupt");
                    warn!(
                        path = %path.display(),
                        error = %e,
                        moved_to = %corrupt_path.display(),
                        "Vector index file malformed; starting empty"
                    );
                    std::fs::rename(&path, &corrupt_path)?;
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Serialize the given entries to disk atomically
    fn persist(&self, entries: &HashMap<String, StoredEntry>) -> Result<(), StageError> {
        let snapshot = IndexSnapshot {
            entries: entries.clone(),
        };
        let json = serde_json::to_string(&snapshot)
            .map_err(|e| StageError::Internal(format!("index serialize failed: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StageError::Internal(format!("index dir create failed: {}", e)))?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .map_err(|e| StageError::Internal(format!("index write failed: {}", e)))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| StageError::Internal(format!("index rename failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(
        &self,
        id: String,
        embedding: Embedding,
        record: LocationRecord,
    ) -> Result<(), StageError> {
        let mut entries = self.entries.write().await;
        let replaced = entries
            .insert(
                id.clone(),
                StoredEntry {
                    embedding: embedding.as_slice().to_vec(),
                    record,
                },
            )
            .is_some();
        self.persist(&entries)?;

        tracing::debug!(id = %id, replaced = replaced, total = entries.len(), "Upserted index entry");
        Ok(())
    }

    async fn query(&self, embedding: &Embedding, k: usize) -> Result<Vec<IndexMatch>, StageError> {
        let entries = self.entries.read().await;
        if entries.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let mut matches: Vec<IndexMatch> = entries
            .iter()
            .map(|(id, entry)| {
                let stored = Embedding::new(entry.embedding.clone());
                IndexMatch {
                    id: id.clone(),
                    score: embedding.cosine(&stored),
                    record: entry.record.clone(),
                }
            })
            .collect();

        // Highest score first; id as a deterministic tiebreak
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(k);
        Ok(matches)
    }

    async fn fetch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, IndexedLocation>, StageError> {
        let entries = self.entries.read().await;
        let mut found = HashMap::new();
        for id in ids {
            if let Some(entry) = entries.get(id) {
                found.insert(
                    id.clone(),
                    IndexedLocation {
                        embedding: Some(Embedding::new(entry.embedding.clone())),
                        record: entry.record.clone(),
                    },
                );
            }
        }
        Ok(found)
    }

    async fn size(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordSource;

    fn record(lat: f64, lon: f64) -> LocationRecord {
        LocationRecord {
            latitude: lat,
            longitude: lon,
            address: None,
            business_name: None,
            source: RecordSource::UserFeedback,
        }
    }

    fn test_index() -> (MemoryIndex, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let index = MemoryIndex::load(dir.path().join("index.json")).unwrap();
        (index, dir)
    }

    #[tokio::test]
    async fn test_empty_query() {
        let (index, _dir) = test_index();
        let results = index
            .query(&Embedding::new(vec![1.0, 0.0]), 5)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_and_query_ranking() {
        let (index, _dir) = test_index();
        index
            .upsert("a".into(), Embedding::new(vec![1.0, 0.0]), record(1.0, 1.0))
            .await
            .unwrap();
        index
            .upsert("b".into(), Embedding::new(vec![0.9, 0.1]), record(2.0, 2.0))
            .await
            .unwrap();
        index
            .upsert("c".into(), Embedding::new(vec![0.0, 1.0]), record(3.0, 3.0))
            .await
            .unwrap();

        let results = index
            .query(&Embedding::new(vec![1.0, 0.0]), 2)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a");
        assert!((results[0].score - 1.0).abs() < 1e-6);
        assert_eq!(results[1].id, "b");
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_id() {
        let (index, _dir) = test_index();
        index
            .upsert("a".into(), Embedding::new(vec![1.0, 0.0]), record(1.0, 1.0))
            .await
            .unwrap();
        index
            .upsert("a".into(), Embedding::new(vec![1.0, 0.0]), record(9.0, 9.0))
            .await
            .unwrap();

        assert_eq!(index.size().await, 1);
        let fetched = index.fetch(&["a".to_string()]).await.unwrap();
        assert_eq!(fetched["a"].record.latitude, 9.0);
    }

    #[tokio::test]
    async fn test_fetch_omits_missing_ids() {
        let (index, _dir) = test_index();
        index
            .upsert("a".into(), Embedding::new(vec![1.0, 0.0]), record(1.0, 1.0))
            .await
            .unwrap();

        let fetched = index
            .fetch(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(fetched.contains_key("a"));
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        {
            let index = MemoryIndex::load(path.clone()).unwrap();
            index
                .upsert(
                    "loc_abc".into(),
                    Embedding::new(vec![0.5, 0.5]),
                    record(6.5244, 3.3792),
                )
                .await
                .unwrap();
        }

        let reloaded = MemoryIndex::load(path).unwrap();
        assert_eq!(reloaded.size().await, 1);
        let fetched = reloaded.fetch(&["loc_abc".to_string()]).await.unwrap();
        assert_eq!(fetched["loc_abc"].record.latitude, 6.5244);
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, "{ not json").unwrap();

        let index = MemoryIndex::load(path.clone()).unwrap();
        assert_eq!(index.size().await, 0);
        // Corrupt snapshot is preserved, not deleted
        assert!(path.with_extension("json.corrupt").exists());
    }
}
