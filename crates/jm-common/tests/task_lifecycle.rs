use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jm_common::embedding::HashEmbedder;
use jm_common::matching::SearchCacheEntry;
use jm_common::ranking::{LearningWeights, RecruiterInteraction};
use jm_common::store::{
    CandidateStore, InteractionStore, JobStore, KindStats, MemoryStore, SearchCacheStore,
    SharedStore, StoreError, TaskStore, WeightsStore,
};
use jm_common::tasks::handlers::{self, CANDIDATE_INDEX_KEY};
use jm_common::tasks::handlers::embeddings::{
    BatchEmbeddingOutcome, BatchEmbeddingRequest, EmbeddingCollection, RegenerationOutcome,
    RegenerationRequest,
};
use jm_common::tasks::handlers::resume::ResumeRequest;
use jm_common::tasks::{
    Services, TaskContext, TaskKind, TaskOrchestrator, TaskRecord, TaskStatus, TaskUpdate,
    WorkerPool, WorkerPoolConfig,
};
use jm_common::vector_index::VectorIndex;
use jm_common::{Candidate, JobPosting};
use serde_json::{Map, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DIM: usize = 16;

fn services_for(store: SharedStore, dir: &tempfile::TempDir) -> Services {
    let index = VectorIndex::new(dir.path().join("i.bin"), dir.path().join("m.json"));
    Services::new(store, index, Arc::new(HashEmbedder::new(DIM)))
}

fn pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        worker_id: "w-1".into(),
        concurrency: 2,
        idle_poll_interval: Duration::from_millis(10),
    }
}

fn setup(dir: &tempfile::TempDir) -> (Arc<MemoryStore>, TaskOrchestrator, WorkerPool) {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = TaskOrchestrator::new(store.clone());
    let pool = orchestrator.worker_pool(services_for(store.clone(), dir), pool_config());
    (store, orchestrator, pool)
}

/// MemoryStore whose candidate listing and task writes can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_listing: AtomicBool,
    fail_task_updates: AtomicBool,
}

fn outage(what: &str) -> StoreError {
    StoreError::Mapping(format!("{what}: connection reset"))
}

#[async_trait]
impl CandidateStore for FlakyStore {
    async fn insert_candidate(&self, candidate: &Candidate) -> Result<(), StoreError> {
        self.inner.insert_candidate(candidate).await
    }

    async fn get_candidate(&self, id: &str) -> Result<Option<Candidate>, StoreError> {
        self.inner.get_candidate(id).await
    }

    async fn list_candidates(&self, limit: usize) -> Result<Vec<Candidate>, StoreError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(outage("list candidates"));
        }
        self.inner.list_candidates(limit).await
    }

    async fn update_candidate_embedding(&self, id: &str, embedding: &[f32]) -> Result<bool, StoreError> {
        self.inner.update_candidate_embedding(id, embedding).await
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn insert_job(&self, job: &JobPosting) -> Result<(), StoreError> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobPosting>, StoreError> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobPosting>, StoreError> {
        self.inner.list_jobs(limit).await
    }

    async fn update_job_embedding(&self, id: &str, embedding: &[f32]) -> Result<bool, StoreError> {
        self.inner.update_job_embedding(id, embedding).await
    }
}

#[async_trait]
impl InteractionStore for FlakyStore {
    async fn insert_interaction(&self, interaction: &RecruiterInteraction) -> Result<(), StoreError> {
        self.inner.insert_interaction(interaction).await
    }

    async fn count_interactions(&self) -> Result<i64, StoreError> {
        self.inner.count_interactions().await
    }

    async fn count_interactions_since(&self, cutoff: DateTime<Utc>) -> Result<i64, StoreError> {
        self.inner.count_interactions_since(cutoff).await
    }

    async fn list_interactions_since(
        &self,
        cutoff: DateTime<Utc>,
        recruiter_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RecruiterInteraction>, StoreError> {
        self.inner.list_interactions_since(cutoff, recruiter_id, limit).await
    }

    async fn interaction_stats_by_kind(&self) -> Result<Vec<KindStats>, StoreError> {
        self.inner.interaction_stats_by_kind().await
    }
}

#[async_trait]
impl WeightsStore for FlakyStore {
    async fn insert_weights(&self, weights: &LearningWeights) -> Result<(), StoreError> {
        self.inner.insert_weights(weights).await
    }

    async fn latest_weights(
        &self,
        job_category: Option<&str>,
        recruiter_id: Option<&str>,
    ) -> Result<Option<LearningWeights>, StoreError> {
        self.inner.latest_weights(job_category, recruiter_id).await
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        self.inner.get_task(task_id).await
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<bool, StoreError> {
        if self.fail_task_updates.load(Ordering::SeqCst) {
            return Err(outage("update task"));
        }
        self.inner.update_task(task_id, update).await
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        self.inner.claim_next_task(worker_id, now).await
    }

    async fn list_tasks_for_owner(
        &self,
        owner: &str,
        kind: Option<TaskKind>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.inner.list_tasks_for_owner(owner, kind, limit).await
    }

    async fn delete_tasks_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.delete_tasks_created_before(cutoff).await
    }

    async fn requeue_incomplete_tasks(&self) -> Result<u64, StoreError> {
        self.inner.requeue_incomplete_tasks().await
    }
}

#[async_trait]
impl SearchCacheStore for FlakyStore {
    async fn put_search_cache(&self, entry: &SearchCacheEntry) -> Result<(), StoreError> {
        self.inner.put_search_cache(entry).await
    }

    async fn get_search_cache(
        &self,
        session_id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SearchCacheEntry>, StoreError> {
        self.inner.get_search_cache(session_id, job_id, now).await
    }

    async fn delete_search_cache_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.delete_search_cache_before(cutoff).await
    }
}

fn regenerate_candidates() -> RegenerationRequest {
    RegenerationRequest {
        collection: EmbeddingCollection::Candidates,
    }
}

#[tokio::test]
async fn submitted_task_runs_to_success_and_cannot_be_cancelled_after() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, orchestrator, pool) = setup(&dir);

    let task_id = orchestrator
        .submit(TaskKind::Cleanup, "u-1", &json!({}))
        .await
        .unwrap();
    assert_eq!(
        orchestrator.get_status(&task_id).await.unwrap().unwrap().record.status,
        TaskStatus::Pending
    );

    assert_eq!(pool.run_once().await.unwrap(), Some(TaskStatus::Success));
    assert_eq!(pool.run_once().await.unwrap(), None);

    let info = orchestrator.get_status(&task_id).await.unwrap().unwrap();
    assert_eq!(info.record.status, TaskStatus::Success);
    assert_eq!(info.record.progress, 100);
    assert!(info.record.completed_at.is_some());
    assert_eq!(info.record.locked_by, None);
    assert_eq!(info.record.result.as_ref().unwrap()["status"], "completed");

    assert!(!orchestrator.cancel(&task_id, "u-1").await.unwrap());
    assert_eq!(
        orchestrator.get_status(&task_id).await.unwrap().unwrap().record.status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn cancelled_task_is_never_claimed() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, orchestrator, pool) = setup(&dir);

    let task_id = orchestrator
        .submit(TaskKind::Cleanup, "u-1", &json!({}))
        .await
        .unwrap();
    assert!(orchestrator.cancel(&task_id, "u-1").await.unwrap());
    assert_eq!(pool.run_once().await.unwrap(), None);

    let info = orchestrator.get_status(&task_id).await.unwrap().unwrap();
    assert_eq!(info.record.status, TaskStatus::Revoked);
    assert_eq!(info.record.error.as_deref(), Some("Task cancelled by user"));
}

#[tokio::test]
async fn malformed_request_fails_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, orchestrator, pool) = setup(&dir);

    let task_id = orchestrator
        .submit(TaskKind::BatchEmbedding, "u-1", &json!({"texts": "not a list"}))
        .await
        .unwrap();
    assert_eq!(pool.run_once().await.unwrap(), Some(TaskStatus::Failure));

    let info = orchestrator.get_status(&task_id).await.unwrap().unwrap();
    assert!(info.record.error.unwrap().starts_with("invalid task request"));
    assert_eq!(info.record.retry_count, 0);
}

#[tokio::test]
async fn eta_is_reported_once_progress_passes_ten_percent() {
    let dir = tempfile::tempdir().unwrap();
    let (store, orchestrator, _pool) = setup(&dir);

    let task_id = orchestrator
        .create(TaskKind::BulkMatching, "u-1", Map::new())
        .await
        .unwrap();
    store.claim_next_task("w-1", Utc::now()).await.unwrap();

    store
        .update_task(&task_id, &TaskUpdate::progress(10, "starting"))
        .await
        .unwrap();
    let info = orchestrator.get_status(&task_id).await.unwrap().unwrap();
    assert_eq!(info.estimated_completion, None);

    store
        .update_task(&task_id, &TaskUpdate::progress(50, "halfway"))
        .await
        .unwrap();
    let info = orchestrator.get_status(&task_id).await.unwrap().unwrap();
    assert!(info.estimated_completion.is_some());
    assert_eq!(info.record.progress_message(), Some("halfway"));
}

#[tokio::test]
async fn recover_requeues_interrupted_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let (store, orchestrator, pool) = setup(&dir);

    let task_id = orchestrator
        .submit(TaskKind::Cleanup, "u-1", &json!({}))
        .await
        .unwrap();
    // 別ワーカーが claim したまま落ちた想定
    store.claim_next_task("crashed", Utc::now()).await.unwrap();
    assert_eq!(pool.run_once().await.unwrap(), None);

    assert_eq!(orchestrator.recover().await.unwrap(), 1);
    let info = orchestrator.get_status(&task_id).await.unwrap().unwrap();
    assert_eq!(info.record.status, TaskStatus::Pending);
    assert_eq!(info.record.locked_by, None);

    assert_eq!(pool.run_once().await.unwrap(), Some(TaskStatus::Success));
}

#[tokio::test]
async fn worker_pool_runs_submitted_tasks_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, orchestrator, pool) = setup(&dir);

    let request = BatchEmbeddingRequest {
        texts: vec!["python developer".into(), "".into(), "rust engineer".into()],
        batch_name: "nightly".into(),
    };
    let task_id = orchestrator
        .submit(TaskKind::BatchEmbedding, "u-1", &request)
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let runner = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    let mut outcome = None;
    for _ in 0..200 {
        let info = orchestrator.get_status(&task_id).await.unwrap().unwrap();
        if info.record.status.is_terminal() {
            outcome = Some(info);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    runner.await.unwrap();

    let info = outcome.expect("task finished");
    assert_eq!(info.record.status, TaskStatus::Success);
    let result: BatchEmbeddingOutcome = serde_json::from_value(info.record.result.unwrap()).unwrap();
    assert_eq!(result.batch_name, "nightly");
    assert_eq!(result.total_processed, 3);
    assert_eq!(result.successful_embeddings, 2);
    assert_eq!(result.failed_embeddings, 1);
}

#[tokio::test]
async fn redelivered_resume_task_overwrites_its_own_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let services = services_for(store.clone(), &dir);
    let orchestrator = TaskOrchestrator::new(store.clone());

    let request = ResumeRequest {
        resume_text: "Rust engineer, 5 years of experience with Postgres".into(),
        name: "Ada".into(),
        ..Default::default()
    };
    let task_id = orchestrator
        .submit(TaskKind::ResumeProcessing, "u-1", &request)
        .await
        .unwrap();

    // 本体は完了したが終端状態を書く前に落ちた、を二回
    for _ in 0..2 {
        let record = store.claim_next_task("w-1", Utc::now()).await.unwrap().unwrap();
        let ctx = TaskContext::new(record.task_id.clone(), store.clone(), CancellationToken::new());
        handlers::run(&services, &ctx, &record).await.unwrap();
        assert_eq!(orchestrator.recover().await.unwrap(), 1);
    }

    let candidates = store.list_candidates(100).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, task_id);

    let index = services.index.read().await;
    assert_eq!(index.ntotal(), 1);
    assert_eq!(index.find_by(CANDIDATE_INDEX_KEY, &task_id), Some(0));
}

#[tokio::test]
async fn retryable_failure_backs_off_then_fails_once_retries_run_out() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyStore::default());
    store.fail_listing.store(true, Ordering::SeqCst);
    let orchestrator = TaskOrchestrator::new(store.clone());
    let pool = orchestrator.worker_pool(services_for(store.clone(), &dir), pool_config());
    let policy = TaskKind::EmbeddingRegeneration.retry_policy();
    assert_eq!(policy.max_retries, 2);

    let task_id = orchestrator
        .submit(TaskKind::EmbeddingRegeneration, "u-1", &regenerate_candidates())
        .await
        .unwrap();

    for attempt in 1..=policy.max_retries {
        let before = Utc::now();
        assert_eq!(pool.run_once().await.unwrap(), Some(TaskStatus::Retry));
        let after = Utc::now();

        let record = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Retry);
        assert_eq!(record.retry_count, attempt);
        assert_eq!(record.locked_by, None);
        assert!(record.error.as_deref().unwrap().contains("connection reset"));

        let backoff = ChronoDuration::seconds(policy.backoff_base_secs << (attempt - 1));
        let next_retry_at = record.next_retry_at.unwrap();
        assert!(next_retry_at >= before + backoff);
        assert!(next_retry_at <= after + backoff);

        // バックオフ中は claim されない
        assert_eq!(pool.run_once().await.unwrap(), None);

        store
            .update_task(
                &task_id,
                &TaskUpdate {
                    next_retry_at: Some(Utc::now() - ChronoDuration::seconds(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    assert_eq!(pool.run_once().await.unwrap(), Some(TaskStatus::Failure));
    let record = store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Failure);
    assert_eq!(record.retry_count, policy.max_retries);
    assert_eq!(record.next_retry_at, None);
    assert!(record.completed_at.is_some());
    assert!(record.error.as_deref().unwrap().contains("connection reset"));

    assert_eq!(pool.run_once().await.unwrap(), None);
}

#[tokio::test]
async fn unpersisted_retry_is_written_back_on_status_poll() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyStore::default());
    store.fail_listing.store(true, Ordering::SeqCst);
    let orchestrator = TaskOrchestrator::new(store.clone());
    let pool = orchestrator.worker_pool(services_for(store.clone(), &dir), pool_config());

    let task_id = orchestrator
        .submit(TaskKind::EmbeddingRegeneration, "u-1", &regenerate_candidates())
        .await
        .unwrap();

    store.fail_task_updates.store(true, Ordering::SeqCst);
    assert_eq!(pool.run_once().await.unwrap(), Some(TaskStatus::Retry));
    assert_eq!(
        store.get_task(&task_id).await.unwrap().unwrap().status,
        TaskStatus::Started
    );
    let held = orchestrator.registry().outcome(&task_id).unwrap();
    assert_eq!(held.status, Some(TaskStatus::Retry));
    assert_eq!(held.retry_count, Some(1));

    store.fail_task_updates.store(false, Ordering::SeqCst);
    let info = orchestrator.get_status(&task_id).await.unwrap().unwrap();
    assert_eq!(info.record.status, TaskStatus::Retry);
    assert_eq!(info.record.retry_count, 1);
    assert!(info.record.next_retry_at.is_some());

    let stored = store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Retry);
    assert_eq!(stored.locked_by, None);
    assert!(orchestrator.registry().is_empty());
}

#[tokio::test]
async fn regeneration_rewrites_candidate_index_entries_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let services = services_for(store.clone(), &dir);
    let orchestrator = TaskOrchestrator::new(store.clone());
    let pool = orchestrator.worker_pool(services.clone(), pool_config());

    let candidate = Candidate::new(
        "c-1",
        "Ada",
        "ada@example.com",
        "Rust and Postgres, distributed systems",
        &["rust".into(), "postgres".into()],
        4,
        "u-1",
    );
    store.insert_candidate(&candidate).await.unwrap();
    let mut stale = vec![0.0; DIM];
    stale[0] = 1.0;
    assert!(services.index_candidate("c-1", "Ada", stale.clone()).await);

    let task_id = orchestrator
        .submit(TaskKind::EmbeddingRegeneration, "u-1", &regenerate_candidates())
        .await
        .unwrap();
    assert_eq!(pool.run_once().await.unwrap(), Some(TaskStatus::Success));

    let info = orchestrator.get_status(&task_id).await.unwrap().unwrap();
    let outcome: RegenerationOutcome = serde_json::from_value(info.record.result.unwrap()).unwrap();
    assert_eq!(outcome.updated_embeddings, 1);
    assert_eq!(outcome.reindexed_vectors, 1);

    let fresh = store.get_candidate("c-1").await.unwrap().unwrap().embedding;
    assert_eq!(fresh.len(), DIM);

    let index = services.index.read().await;
    assert_eq!(index.ntotal(), 1);
    let hits = index.search(&fresh, 1, 0.0);
    assert_eq!(hits[0].id, 0);
    assert!((hits[0].score - 1.0).abs() < 1e-5);
    assert_eq!(hits[0].metadata["candidate_id"], "c-1");

    let reopened = VectorIndex::open(index.index_path(), index.metadata_path());
    assert_eq!(reopened.ntotal(), 1);
    assert!((reopened.search(&fresh, 1, 0.0)[0].score - 1.0).abs() < 1e-5);
}
