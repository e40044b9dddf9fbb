pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::matching::pipeline::SearchCacheEntry;
use crate::ranking::interaction::{InteractionKind, RecruiterInteraction};
use crate::ranking::learning_weights::LearningWeights;
use crate::tasks::record::{TaskKind, TaskRecord, TaskUpdate};
use crate::{Candidate, JobPosting};

pub use memory::MemoryStore;

/// Interaction history queries never return more rows than this.
pub const MAX_INTERACTION_ROWS: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("row mapping error: {0}")]
    Mapping(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Count and mean reward per interaction kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindStats {
    pub kind: InteractionKind,
    pub count: i64,
    pub avg_reward: f64,
}

#[async_trait]
pub trait CandidateStore: Send + Sync {
    /// Insert or replace by id.
    async fn insert_candidate(&self, candidate: &Candidate) -> Result<(), StoreError>;
    async fn get_candidate(&self, id: &str) -> Result<Option<Candidate>, StoreError>;
    /// Insertion order.
    async fn list_candidates(&self, limit: usize) -> Result<Vec<Candidate>, StoreError>;
    /// Returns `false` when no such candidate exists.
    async fn update_candidate_embedding(&self, id: &str, embedding: &[f32]) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &JobPosting) -> Result<(), StoreError>;
    async fn get_job(&self, id: &str) -> Result<Option<JobPosting>, StoreError>;
    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobPosting>, StoreError>;
    async fn update_job_embedding(&self, id: &str, embedding: &[f32]) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait InteractionStore: Send + Sync {
    async fn insert_interaction(&self, interaction: &RecruiterInteraction) -> Result<(), StoreError>;
    async fn count_interactions(&self) -> Result<i64, StoreError>;
    async fn count_interactions_since(&self, cutoff: DateTime<Utc>) -> Result<i64, StoreError>;
    /// Newest first, at most `min(limit, MAX_INTERACTION_ROWS)` rows.
    async fn list_interactions_since(
        &self,
        cutoff: DateTime<Utc>,
        recruiter_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RecruiterInteraction>, StoreError>;
    async fn interaction_stats_by_kind(&self) -> Result<Vec<KindStats>, StoreError>;
}

#[async_trait]
pub trait WeightsStore: Send + Sync {
    /// Append. History is never rewritten.
    async fn insert_weights(&self, weights: &LearningWeights) -> Result<(), StoreError>;
    /// Most recent record by `last_updated`. A `None` filter matches any value.
    async fn latest_weights(
        &self,
        job_category: Option<&str>,
        recruiter_id: Option<&str>,
    ) -> Result<Option<LearningWeights>, StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), StoreError>;
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;
    /// Applies `update` unless the record is missing or already terminal.
    /// Returns whether the record was changed.
    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<bool, StoreError>;
    /// Oldest claimable task (pending, or retry past its backoff), moved to
    /// `started` and locked by `worker_id`.
    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError>;
    /// Newest first.
    async fn list_tasks_for_owner(
        &self,
        owner: &str,
        kind: Option<TaskKind>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;
    async fn delete_tasks_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
    /// `started` / `progress` back to `pending`, for re-delivery after a
    /// worker restart.
    async fn requeue_incomplete_tasks(&self) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait SearchCacheStore: Send + Sync {
    /// Insert or replace by `(session_id, job_id)`.
    async fn put_search_cache(&self, entry: &SearchCacheEntry) -> Result<(), StoreError>;
    /// Expired entries read as missing.
    async fn get_search_cache(
        &self,
        session_id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SearchCacheEntry>, StoreError>;
    async fn delete_search_cache_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Everything the core needs from the document store.
pub trait Store:
    CandidateStore + JobStore + InteractionStore + WeightsStore + TaskStore + SearchCacheStore
{
}

impl<T> Store for T where
    T: CandidateStore + JobStore + InteractionStore + WeightsStore + TaskStore + SearchCacheStore
{
}

pub type SharedStore = Arc<dyn Store>;
