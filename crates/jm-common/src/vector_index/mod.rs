mod storage;

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::matching::similarity::l2_normalize;
use storage::IndexSnapshot;

#[derive(Debug, Error)]
pub enum VectorIndexError {
    #[error("index io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("index metadata json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("vector dimension mismatch: index has {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("{vectors} vectors but {metadata} metadata records")]
    MetadataMismatch { vectors: usize, metadata: usize },
    #[error("empty vector at batch position {0}")]
    EmptyVector(usize),
    #[error("corrupt index file: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: u64,
    pub score: f32,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub ntotal: usize,
    pub dimension: Option<usize>,
    pub index_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Index state detached from the live index, written with blocking file IO.
#[derive(Debug, Clone)]
pub struct PendingSave {
    snapshot: IndexSnapshot,
    metadata: BTreeMap<u64, Value>,
    index_path: PathBuf,
    metadata_path: PathBuf,
}

impl PendingSave {
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn ntotal(&self) -> usize {
        self.snapshot.vectors.len() / (self.snapshot.dimension as usize).max(1)
    }

    pub fn write(&self) -> Result<(), VectorIndexError> {
        storage::save_index(&self.index_path, &self.snapshot)?;
        storage::save_metadata(&self.metadata_path, &self.metadata)?;
        info!(
            ntotal = self.ntotal(),
            path = %self.index_path.display(),
            "vector index saved"
        );
        Ok(())
    }
}

/// Exact inner-product index over L2-normalized rows, so scores are cosine
/// similarities.
///
/// Ids are row offsets. Rows are only ever appended, which keeps ids stable
/// across save/load.
#[derive(Debug)]
pub struct VectorIndex {
    dimension: Option<usize>,
    vectors: Vec<f32>,
    metadata: BTreeMap<u64, Value>,
    index_path: PathBuf,
    metadata_path: PathBuf,
}

impl VectorIndex {
    /// Empty, uninitialized index. Nothing is read from disk.
    pub fn new(index_path: impl Into<PathBuf>, metadata_path: impl Into<PathBuf>) -> Self {
        Self {
            dimension: None,
            vectors: Vec::new(),
            metadata: BTreeMap::new(),
            index_path: index_path.into(),
            metadata_path: metadata_path.into(),
        }
    }

    /// `new` followed by `load`. A missing or unreadable file leaves the
    /// index empty; the error is logged.
    pub fn open(index_path: impl Into<PathBuf>, metadata_path: impl Into<PathBuf>) -> Self {
        let mut index = Self::new(index_path, metadata_path);
        match index.load() {
            Ok(true) => info!(
                ntotal = index.ntotal(),
                dimension = ?index.dimension,
                path = %index.index_path.display(),
                "vector index loaded"
            ),
            Ok(false) => info!(
                path = %index.index_path.display(),
                "no vector index on disk; starting empty"
            ),
            Err(e) => warn!(
                error = %e,
                path = %index.index_path.display(),
                "failed to load vector index; starting empty"
            ),
        }
        index
    }

    pub fn ntotal(&self) -> usize {
        match self.dimension {
            Some(d) if d > 0 => self.vectors.len() / d,
            _ => 0,
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.ntotal() == 0
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    /// Append a batch. The first batch fixes the dimension.
    ///
    /// The whole batch is validated before anything is stored, so a bad row
    /// leaves the index unchanged.
    pub fn add(
        &mut self,
        vectors: &[Vec<f32>],
        metadata: Vec<Value>,
    ) -> Result<Vec<u64>, VectorIndexError> {
        if vectors.len() != metadata.len() {
            return Err(VectorIndexError::MetadataMismatch {
                vectors: vectors.len(),
                metadata: metadata.len(),
            });
        }
        let Some(first) = vectors.first() else {
            return Ok(Vec::new());
        };

        let expected = self.dimension.unwrap_or(first.len());
        for (pos, vector) in vectors.iter().enumerate() {
            if vector.is_empty() {
                return Err(VectorIndexError::EmptyVector(pos));
            }
            if vector.len() != expected {
                return Err(VectorIndexError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
        }

        self.dimension = Some(expected);
        let start = self.ntotal() as u64;
        let mut ids = Vec::with_capacity(vectors.len());
        for (offset, (vector, meta)) in vectors.iter().zip(metadata).enumerate() {
            let mut row = vector.clone();
            l2_normalize(&mut row);
            self.vectors.extend_from_slice(&row);

            let id = start + offset as u64;
            self.metadata.insert(id, meta);
            ids.push(id);
        }
        Ok(ids)
    }

    /// Top `k` hits with `score >= threshold`, best first. Equal scores are
    /// ordered by id.
    ///
    /// Never fails: an empty index or a query of the wrong dimension yields
    /// no hits.
    pub fn search(&self, query: &[f32], k: usize, threshold: f32) -> Vec<SearchHit> {
        let Some(dimension) = self.dimension else {
            return Vec::new();
        };
        if k == 0 || self.vectors.is_empty() {
            return Vec::new();
        }
        if query.len() != dimension {
            warn!(
                expected = dimension,
                got = query.len(),
                "query dimension mismatch; returning no hits"
            );
            return Vec::new();
        }

        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let mut scored: Vec<(u64, f32)> = self
            .vectors
            .chunks_exact(dimension)
            .enumerate()
            .map(|(row, v)| {
                let dot: f32 = v.iter().zip(&q).map(|(a, b)| a * b).sum();
                (row as u64, dot)
            })
            .filter(|(_, score)| score.is_finite() && *score >= threshold)
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(id, score)| SearchHit {
                id,
                score,
                metadata: self.metadata.get(&id).cloned().unwrap_or(Value::Null),
            })
            .collect()
    }

    pub fn metadata(&self, id: u64) -> Option<&Value> {
        self.metadata.get(&id)
    }

    /// Row whose metadata has the string field `key` equal to `value`.
    pub fn find_by(&self, key: &str, value: &str) -> Option<u64> {
        self.metadata
            .iter()
            .find(|(_, meta)| meta.get(key).and_then(Value::as_str) == Some(value))
            .map(|(id, _)| *id)
    }

    /// Replace the vector and metadata of the entry whose `key` field equals
    /// `value`, keeping its id, or append a new entry when there is none.
    pub fn upsert(
        &mut self,
        key: &str,
        value: &str,
        vector: Vec<f32>,
        metadata: Value,
    ) -> Result<u64, VectorIndexError> {
        let existing = self
            .find_by(key, value)
            .filter(|id| (*id as usize) < self.ntotal());
        let (Some(id), Some(dimension)) = (existing, self.dimension) else {
            let ids = self.add(std::slice::from_ref(&vector), vec![metadata])?;
            return ids.first().copied().ok_or(VectorIndexError::EmptyVector(0));
        };

        if vector.is_empty() {
            return Err(VectorIndexError::EmptyVector(0));
        }
        if vector.len() != dimension {
            return Err(VectorIndexError::DimensionMismatch {
                expected: dimension,
                got: vector.len(),
            });
        }
        let mut row = vector;
        l2_normalize(&mut row);
        let start = id as usize * dimension;
        self.vectors[start..start + dimension].copy_from_slice(&row);
        self.metadata.insert(id, metadata);
        Ok(id)
    }

    /// Owned copy of what [`VectorIndex::save`] writes. `None` for an index
    /// that was never populated.
    pub fn pending_save(&self) -> Result<Option<PendingSave>, VectorIndexError> {
        let Some(dimension) = self.dimension else {
            return Ok(None);
        };
        let dimension = u32::try_from(dimension)
            .map_err(|_| VectorIndexError::Corrupt(format!("dimension {dimension} too large")))?;

        Ok(Some(PendingSave {
            snapshot: IndexSnapshot {
                dimension,
                vectors: self.vectors.clone(),
            },
            metadata: self.metadata.clone(),
            index_path: self.index_path.clone(),
            metadata_path: self.metadata_path.clone(),
        }))
    }

    /// Overwrite both files. An index that was never populated writes nothing.
    pub fn save(&self) -> Result<(), VectorIndexError> {
        match self.pending_save()? {
            Some(pending) => pending.write(),
            None => Ok(()),
        }
    }

    /// Replace in-memory state with what is on disk. Returns `false` when no
    /// index file exists, in which case the current state is kept.
    pub fn load(&mut self) -> Result<bool, VectorIndexError> {
        let Some(snapshot) = storage::load_index(&self.index_path)? else {
            return Ok(false);
        };
        let metadata = storage::load_metadata(&self.metadata_path)?;

        let dimension = snapshot.dimension as usize;
        let rows = snapshot.vectors.len() / dimension;
        if metadata.len() != rows {
            warn!(
                rows,
                metadata = metadata.len(),
                "index rows and metadata records disagree"
            );
        }

        self.dimension = Some(dimension);
        self.vectors = snapshot.vectors;
        self.metadata = metadata;
        Ok(true)
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            ntotal: self.ntotal(),
            dimension: self.dimension,
            index_path: self.index_path.clone(),
            metadata_path: self.metadata_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index_in(dir: &Path) -> VectorIndex {
        VectorIndex::new(dir.join("vector.index"), dir.join("vector_metadata.json"))
    }

    #[test]
    fn fresh_index_search_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path());

        for k in [0, 1, 10, 1000] {
            assert!(index.search(&[1.0, 0.0], k, -1.0).is_empty());
        }
        assert_eq!(index.ntotal(), 0);
        assert_eq!(index.dimension(), None);
    }

    #[test]
    fn ids_are_contiguous_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());

        let first = index
            .add(&[vec![1.0, 0.0], vec![0.0, 1.0]], vec![json!({}), json!({})])
            .unwrap();
        let second = index.add(&[vec![1.0, 1.0]], vec![json!({})]).unwrap();

        assert_eq!(first, vec![0, 1]);
        assert_eq!(second, vec![2]);
        assert_eq!(index.ntotal(), 3);
    }

    #[test]
    fn dimension_is_fixed_by_first_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());
        index.add(&[vec![1.0, 0.0, 0.0]], vec![json!({})]).unwrap();

        let err = index
            .add(&[vec![1.0, 0.0]], vec![json!({})])
            .unwrap_err();

        assert!(matches!(
            err,
            VectorIndexError::DimensionMismatch {
                expected: 3,
                got: 2
            }
        ));
        assert_eq!(index.ntotal(), 1);
    }

    #[test]
    fn rejects_batch_with_mismatched_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());

        let err = index.add(&[vec![1.0]], vec![]).unwrap_err();

        assert!(matches!(err, VectorIndexError::MetadataMismatch { .. }));
        assert_eq!(index.dimension(), None);
    }

    #[test]
    fn zero_vector_is_stored_without_nan() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());
        index
            .add(
                &[vec![0.0, 0.0], vec![3.0, 4.0]],
                vec![json!({"n": 0}), json!({"n": 1})],
            )
            .unwrap();

        let hits = index.search(&[3.0, 4.0], 10, -1.0);

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].score, 0.0);
    }

    #[test]
    fn search_respects_k_and_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());
        index
            .add(
                &[vec![1.0, 0.0], vec![0.7, 0.7], vec![0.0, 1.0], vec![-1.0, 0.0]],
                vec![json!({}), json!({}), json!({}), json!({})],
            )
            .unwrap();

        let top1 = index.search(&[1.0, 0.0], 1, -1.0);
        assert_eq!(top1.len(), 1);
        assert_eq!(top1[0].id, 0);

        let positive = index.search(&[1.0, 0.0], 10, 0.5);
        let ids: Vec<_> = positive.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn equal_scores_are_ordered_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());
        index
            .add(
                &[vec![0.0, 1.0], vec![0.0, 2.0], vec![0.0, 5.0]],
                vec![json!({}), json!({}), json!({})],
            )
            .unwrap();

        let ids: Vec<_> = index
            .search(&[0.0, 1.0], 3, 0.0)
            .iter()
            .map(|h| h.id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn wrong_query_dimension_yields_no_hits() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());
        index.add(&[vec![1.0, 0.0]], vec![json!({})]).unwrap();

        assert!(index.search(&[1.0, 0.0, 0.0], 5, -1.0).is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());
        index
            .add(
                &[vec![1.0, 2.0, 3.0], vec![0.5, 0.0, 0.1]],
                vec![
                    json!({"type": "candidate", "candidate_id": "c1", "name": "Ada"}),
                    json!({"type": "job", "job_id": "j1"}),
                ],
            )
            .unwrap();
        index.save().unwrap();

        let mut reloaded = index_in(dir.path());
        assert!(reloaded.load().unwrap());

        assert_eq!(reloaded.ntotal(), 2);
        assert_eq!(reloaded.dimension(), Some(3));
        assert_eq!(reloaded.metadata(0), index.metadata(0));
        assert_eq!(reloaded.metadata(1), index.metadata(1));

        let next = reloaded.add(&[vec![0.0, 0.0, 1.0]], vec![json!({})]).unwrap();
        assert_eq!(next, vec![2]);
    }

    #[test]
    fn load_without_files_keeps_index_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());

        assert!(!index.load().unwrap());
        assert!(index.is_empty());
    }

    #[test]
    fn saving_uninitialized_index_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path());

        index.save().unwrap();

        assert!(!index.index_path().exists());
        assert!(!index.metadata_path().exists());
    }

    #[test]
    fn open_survives_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vector.index"), b"garbage").unwrap();

        let index = VectorIndex::open(
            dir.path().join("vector.index"),
            dir.path().join("vector_metadata.json"),
        );

        assert!(index.is_empty());
    }

    #[test]
    fn upsert_replaces_row_and_keeps_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());
        index
            .add(
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
                vec![
                    json!({"type": "candidate", "candidate_id": "c1"}),
                    json!({"type": "candidate", "candidate_id": "c2"}),
                ],
            )
            .unwrap();

        let id = index
            .upsert(
                "candidate_id",
                "c1",
                vec![0.0, 3.0],
                json!({"type": "candidate", "candidate_id": "c1", "name": "Ada"}),
            )
            .unwrap();

        assert_eq!(id, 0);
        assert_eq!(index.ntotal(), 2);
        assert_eq!(index.metadata(0).unwrap()["name"], "Ada");
        let hits = index.search(&[0.0, 1.0], 2, 0.9);
        let ids: Vec<_> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![0, 1]);

        let appended = index
            .upsert("candidate_id", "c3", vec![1.0, 1.0], json!({"candidate_id": "c3"}))
            .unwrap();
        assert_eq!(appended, 2);
        assert_eq!(index.find_by("candidate_id", "c3"), Some(2));
        assert_eq!(index.find_by("candidate_id", "nope"), None);
    }

    #[test]
    fn upsert_checks_dimension_of_existing_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());
        index
            .add(&[vec![1.0, 0.0]], vec![json!({"candidate_id": "c1"})])
            .unwrap();

        let err = index
            .upsert("candidate_id", "c1", vec![1.0, 0.0, 0.0], json!({}))
            .unwrap_err();

        assert!(matches!(err, VectorIndexError::DimensionMismatch { expected: 2, got: 3 }));
        assert_eq!(index.metadata(0), Some(&json!({"candidate_id": "c1"})));
    }

    #[test]
    fn pending_save_writes_a_detached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_in(dir.path());
        assert!(index.pending_save().unwrap().is_none());

        index.add(&[vec![1.0, 0.0]], vec![json!({"n": 0})]).unwrap();
        let pending = index.pending_save().unwrap().unwrap();
        index.add(&[vec![0.0, 1.0]], vec![json!({"n": 1})]).unwrap();
        pending.write().unwrap();

        let mut reloaded = index_in(dir.path());
        assert!(reloaded.load().unwrap());
        assert_eq!(reloaded.ntotal(), 1);
        assert_eq!(pending.ntotal(), 1);
    }
}
