//! Task bodies, one module per task kind.

pub mod bulk;
pub mod embeddings;
pub mod learning;
pub mod maintenance;
pub mod resume;
pub mod search;

use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use super::record::{TaskKind, TaskRecord};
use super::runtime::{TaskContext, TaskError, TaskResult};
use crate::embedding::{EmbedRetryPolicy, Embedder, embed_with_retry};
use crate::ranking::{OptimizerConfig, RankOptimizer};
use crate::store::SharedStore;
use crate::vector_index::VectorIndex;

/// Metadata field that ties an index entry to its candidate.
pub const CANDIDATE_INDEX_KEY: &str = "candidate_id";

/// Everything a task body may touch. Cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub store: SharedStore,
    pub index: Arc<RwLock<VectorIndex>>,
    pub embedder: Arc<dyn Embedder>,
    pub optimizer: RankOptimizer,
    pub embed_retry: EmbedRetryPolicy,
    /// Serializes index file writes.
    persist: Arc<Mutex<()>>,
}

impl Services {
    pub fn new(store: SharedStore, index: VectorIndex, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            optimizer: RankOptimizer::new(store.clone(), OptimizerConfig::default()),
            store,
            index: Arc::new(RwLock::new(index)),
            embedder,
            embed_retry: EmbedRetryPolicy::default(),
            persist: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_optimizer_config(mut self, config: OptimizerConfig) -> Self {
        self.optimizer = RankOptimizer::new(self.store.clone(), config);
        self
    }

    pub fn with_embed_retry(mut self, policy: EmbedRetryPolicy) -> Self {
        self.embed_retry = policy;
        self
    }

    /// `[]` when the embedder keeps failing.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        embed_with_retry(self.embedder.as_ref(), text, self.embed_retry).await
    }

    /// Put a candidate's vector into the in-memory index, replacing the
    /// entry a previous run of the same task left behind. Nothing is written.
    pub async fn stage_candidate_vector(&self, candidate_id: &str, name: &str, vector: Vec<f32>) -> bool {
        let metadata = json!({
            "type": "candidate",
            CANDIDATE_INDEX_KEY: candidate_id,
            "name": name,
        });
        let mut index = self.index.write().await;
        match index.upsert(CANDIDATE_INDEX_KEY, candidate_id, vector, metadata) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, candidate_id, "failed to add vector to index");
                false
            }
        }
    }

    /// Stage a candidate vector and rewrite the index files. Write failures
    /// are only logged; the store stays the source of truth.
    pub async fn index_candidate(&self, candidate_id: &str, name: &str, vector: Vec<f32>) -> bool {
        let staged = self.stage_candidate_vector(candidate_id, name, vector).await;
        if staged {
            self.persist_index().await;
        }
        staged
    }

    /// Write the index files on the blocking pool. The index lock is only
    /// held while the snapshot is taken.
    pub async fn persist_index(&self) -> bool {
        let _turn = self.persist.lock().await;
        let pending = self.index.read().await.pending_save();
        let pending = match pending {
            Ok(Some(pending)) => pending,
            Ok(None) => return true,
            Err(e) => {
                warn!(error = %e, "failed to snapshot vector index");
                return false;
            }
        };

        let path = pending.index_path().display().to_string();
        match tokio::task::spawn_blocking(move || pending.write()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, path, "failed to save vector index");
                false
            }
            Err(e) => {
                warn!(error = %e, path, "vector index writer panicked");
                false
            }
        }
    }
}

/// Dispatch a claimed record to its body.
pub async fn run(services: &Services, ctx: &TaskContext, record: &TaskRecord) -> TaskResult {
    match record.kind {
        TaskKind::ResumeProcessing => {
            resume::process_resume(services, ctx, record.request()?, &record.owner).await
        }
        TaskKind::CandidateSearch => {
            search::search_candidates(services, ctx, record.request()?, &record.owner).await
        }
        TaskKind::BulkMatching => {
            bulk::bulk_matching(services, ctx, record.request()?, &record.owner).await
        }
        TaskKind::BatchEmbedding => {
            embeddings::generate_batch(services, ctx, record.request()?).await
        }
        TaskKind::EmbeddingRegeneration => {
            embeddings::regenerate_all(services, ctx, record.request()?).await
        }
        TaskKind::ModelRetraining => {
            learning::retrain_model(services, ctx, record.request()?).await
        }
        TaskKind::PeriodicRetrain => learning::periodic_retrain(services, ctx).await,
        TaskKind::Cleanup => maintenance::cleanup(services, ctx).await,
    }
}

pub(crate) fn into_result<T: Serialize>(value: &T) -> TaskResult {
    serde_json::to_value(value)
        .map_err(|e| TaskError::permanent(format!("unserializable result: {e}")))
}

/// Progress inside a `[from, to]` band after `done` of `total` items.
pub(crate) fn band_progress(from: u8, to: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return to;
    }
    let span = f64::from(to.saturating_sub(from));
    let step = (done.min(total) as f64 / total as f64 * span) as u8;
    from.saturating_add(step).min(to)
}
