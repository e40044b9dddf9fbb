pub mod candidates;
pub mod interactions;
pub mod job_postings;
pub mod learning_weights;
pub mod migrations;
pub mod pool;
pub mod search_cache;
pub mod tasks;
pub mod util;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::matching::pipeline::SearchCacheEntry;
use crate::ranking::interaction::RecruiterInteraction;
use crate::ranking::learning_weights::LearningWeights;
use crate::store::{
    CandidateStore, InteractionStore, JobStore, KindStats, SearchCacheStore, StoreError,
    TaskStore, WeightsStore,
};
use crate::tasks::record::{TaskKind, TaskRecord, TaskUpdate};
use crate::{Candidate, JobPosting};

pub use migrations::{MigrationError, run_migrations};
pub use pool::{DbPoolError, PgPool, PoolSettings, create_pool, create_pool_from_url};

/// Postgres-backed store. Every table lives in the `jm` schema.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CandidateStore for PgStore {
    async fn insert_candidate(&self, candidate: &Candidate) -> Result<(), StoreError> {
        candidates::upsert_candidate(&self.pool, candidate).await
    }

    async fn get_candidate(&self, id: &str) -> Result<Option<Candidate>, StoreError> {
        candidates::fetch_candidate(&self.pool, id).await
    }

    async fn list_candidates(&self, limit: usize) -> Result<Vec<Candidate>, StoreError> {
        candidates::list_candidates(&self.pool, limit).await
    }

    async fn update_candidate_embedding(&self, id: &str, embedding: &[f32]) -> Result<bool, StoreError> {
        candidates::update_candidate_embedding(&self.pool, id, embedding).await
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: &JobPosting) -> Result<(), StoreError> {
        job_postings::upsert_job(&self.pool, job).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobPosting>, StoreError> {
        job_postings::fetch_job(&self.pool, id).await
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobPosting>, StoreError> {
        job_postings::list_jobs(&self.pool, limit).await
    }

    async fn update_job_embedding(&self, id: &str, embedding: &[f32]) -> Result<bool, StoreError> {
        job_postings::update_job_embedding(&self.pool, id, embedding).await
    }
}

#[async_trait]
impl InteractionStore for PgStore {
    async fn insert_interaction(&self, interaction: &RecruiterInteraction) -> Result<(), StoreError> {
        interactions::insert_interaction(&self.pool, interaction).await
    }

    async fn count_interactions(&self) -> Result<i64, StoreError> {
        interactions::count_interactions(&self.pool, None).await
    }

    async fn count_interactions_since(&self, cutoff: DateTime<Utc>) -> Result<i64, StoreError> {
        interactions::count_interactions(&self.pool, Some(cutoff)).await
    }

    async fn list_interactions_since(
        &self,
        cutoff: DateTime<Utc>,
        recruiter_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RecruiterInteraction>, StoreError> {
        interactions::list_interactions_since(&self.pool, cutoff, recruiter_id, limit).await
    }

    async fn interaction_stats_by_kind(&self) -> Result<Vec<KindStats>, StoreError> {
        interactions::stats_by_kind(&self.pool).await
    }
}

#[async_trait]
impl WeightsStore for PgStore {
    async fn insert_weights(&self, weights: &LearningWeights) -> Result<(), StoreError> {
        learning_weights::insert_weights(&self.pool, weights).await
    }

    async fn latest_weights(
        &self,
        job_category: Option<&str>,
        recruiter_id: Option<&str>,
    ) -> Result<Option<LearningWeights>, StoreError> {
        learning_weights::latest_weights(&self.pool, job_category, recruiter_id).await
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        tasks::insert_task(&self.pool, task).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        tasks::fetch_task(&self.pool, task_id).await
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<bool, StoreError> {
        tasks::update_task(&self.pool, task_id, update).await
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        tasks::claim_next_task(&self.pool, worker_id, now).await
    }

    async fn list_tasks_for_owner(
        &self,
        owner: &str,
        kind: Option<TaskKind>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        tasks::list_for_owner(&self.pool, owner, kind, limit).await
    }

    async fn delete_tasks_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        tasks::delete_created_before(&self.pool, cutoff).await
    }

    async fn requeue_incomplete_tasks(&self) -> Result<u64, StoreError> {
        tasks::requeue_incomplete(&self.pool).await
    }
}

#[async_trait]
impl SearchCacheStore for PgStore {
    async fn put_search_cache(&self, entry: &SearchCacheEntry) -> Result<(), StoreError> {
        search_cache::put_entry(&self.pool, entry).await
    }

    async fn get_search_cache(
        &self,
        session_id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SearchCacheEntry>, StoreError> {
        search_cache::get_entry(&self.pool, session_id, job_id, now).await
    }

    async fn delete_search_cache_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        search_cache::delete_before(&self.pool, cutoff).await
    }
}
