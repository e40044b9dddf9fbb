use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use super::handlers::Services;
use super::record::{REQUEST_KEY, TaskInfo, TaskKind, TaskRecord, TaskUpdate};
use super::runtime::{RuntimeRegistry, WorkerPool, WorkerPoolConfig};
use crate::store::{SharedStore, StoreError, TaskStore};

/// Listing size when the caller gives no limit.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Front door for background work: creates task records, reports their
/// status, and cancels them. Execution happens in a [`WorkerPool`] that
/// shares this orchestrator's registry.
#[derive(Clone)]
pub struct TaskOrchestrator {
    store: SharedStore,
    registry: Arc<RuntimeRegistry>,
    notify: Arc<Notify>,
}

impl TaskOrchestrator {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            registry: Arc::new(RuntimeRegistry::new()),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    /// Insert a pending record and return its id.
    #[instrument(skip(self, metadata), fields(kind = kind.as_str()))]
    pub async fn create(
        &self,
        kind: TaskKind,
        owner: &str,
        metadata: Map<String, Value>,
    ) -> Result<String, StoreError> {
        let task_id = crate::run_id::generate();
        let record = TaskRecord::new(task_id.clone(), kind, owner, metadata, Utc::now());
        self.store.insert_task(&record).await?;
        info!(task_id = %task_id, owner, "task created");
        Ok(task_id)
    }

    /// Create a task carrying `request` as its arguments and wake a worker.
    pub async fn submit<T: Serialize>(
        &self,
        kind: TaskKind,
        owner: &str,
        request: &T,
    ) -> Result<String, StoreError> {
        let mut metadata = Map::new();
        metadata.insert(REQUEST_KEY.into(), serde_json::to_value(request)?);
        let task_id = self.create(kind, owner, metadata).await?;
        self.notify.notify_one();
        Ok(task_id)
    }

    /// Current record plus ETA. An outcome the worker could not
    /// persist is written back (or overlaid) here.
    pub async fn get_status(&self, task_id: &str) -> Result<Option<TaskInfo>, StoreError> {
        let Some(mut record) = self.store.get_task(task_id).await? else {
            return Ok(None);
        };

        if record.status.is_terminal() {
            self.registry.forget(task_id);
        } else if let Some(outcome) = self.registry.outcome(task_id) {
            match self.store.update_task(task_id, &outcome).await {
                Ok(true) => {
                    record.apply(&outcome, Utc::now());
                    self.registry.forget(task_id);
                }
                Ok(false) => {
                    self.registry.forget(task_id);
                    if let Some(latest) = self.store.get_task(task_id).await? {
                        record = latest;
                    }
                }
                Err(e) => {
                    warn!(task_id, error = %e, "store still unavailable; reporting in-memory outcome");
                    record.apply(&outcome, Utc::now());
                }
            }
        }

        Ok(Some(TaskInfo::from_record(record, Utc::now())))
    }

    /// Revoke a task owned by `owner`. Returns `false` when the task is
    /// missing, owned by someone else, or already finished.
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: &str, owner: &str) -> Result<bool, StoreError> {
        let Some(record) = self.store.get_task(task_id).await? else {
            return Ok(false);
        };
        if record.owner != owner || record.status.is_terminal() {
            return Ok(false);
        }

        let signalled = self.registry.cancel(task_id);
        let revoked = self
            .store
            .update_task(task_id, &TaskUpdate::revoked("Task cancelled by user", Utc::now()))
            .await?;
        if revoked {
            info!(task_id, signalled, "task cancelled");
        }
        Ok(revoked)
    }

    /// Newest first. `limit` defaults to [`DEFAULT_LIST_LIMIT`].
    pub async fn list_for_owner(
        &self,
        owner: &str,
        kind: Option<TaskKind>,
        limit: Option<usize>,
    ) -> Result<Vec<TaskInfo>, StoreError> {
        let now = Utc::now();
        let records = self
            .store
            .list_tasks_for_owner(owner, kind, limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .await?;
        Ok(records
            .into_iter()
            .map(|record| TaskInfo::from_record(record, now))
            .collect())
    }

    /// Put tasks interrupted by a restart back on the queue.
    pub async fn recover(&self) -> Result<u64, StoreError> {
        let requeued = self.store.requeue_incomplete_tasks().await?;
        if requeued > 0 {
            info!(requeued, "requeued interrupted tasks");
            self.notify.notify_waiters();
        }
        Ok(requeued)
    }

    /// Worker pool wired to this orchestrator's registry and wake-ups.
    pub fn worker_pool(&self, services: Services, config: WorkerPoolConfig) -> WorkerPool {
        WorkerPool::new(services, self.registry.clone(), self.notify.clone(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tasks::record::TaskStatus;
    use serde_json::json;

    fn orchestrator() -> (Arc<MemoryStore>, TaskOrchestrator) {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = TaskOrchestrator::new(store.clone());
        (store, orchestrator)
    }

    #[tokio::test]
    async fn submit_stores_request_as_pending() {
        let (_, orchestrator) = orchestrator();
        let id = orchestrator
            .submit(TaskKind::CandidateSearch, "u-1", &json!({"job_id": "j-1"}))
            .await
            .unwrap();

        let info = orchestrator.get_status(&id).await.unwrap().unwrap();
        assert_eq!(info.record.status, TaskStatus::Pending);
        assert_eq!(info.record.progress, 0);
        assert_eq!(info.record.metadata[REQUEST_KEY], json!({"job_id": "j-1"}));
        assert_eq!(info.estimated_completion, None);
    }

    #[tokio::test]
    async fn cancel_checks_owner_and_state() {
        let (_, orchestrator) = orchestrator();
        let id = orchestrator
            .create(TaskKind::Cleanup, "u-1", Map::new())
            .await
            .unwrap();

        assert!(!orchestrator.cancel(&id, "someone-else").await.unwrap());
        assert!(!orchestrator.cancel("missing", "u-1").await.unwrap());
        assert!(orchestrator.cancel(&id, "u-1").await.unwrap());
        assert!(!orchestrator.cancel(&id, "u-1").await.unwrap());

        let info = orchestrator.get_status(&id).await.unwrap().unwrap();
        assert_eq!(info.record.status, TaskStatus::Revoked);
        assert_eq!(info.record.error.as_deref(), Some("Task cancelled by user"));
    }

    #[tokio::test]
    async fn unpersisted_outcome_is_written_back_on_poll() {
        let (store, orchestrator) = orchestrator();
        let id = orchestrator
            .create(TaskKind::Cleanup, "u-1", Map::new())
            .await
            .unwrap();
        orchestrator
            .registry()
            .finish(&id, TaskUpdate::success(json!({"done": true}), Utc::now()));

        let info = orchestrator.get_status(&id).await.unwrap().unwrap();
        assert_eq!(info.record.status, TaskStatus::Success);
        assert!(orchestrator.registry().is_empty());

        let stored = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.result, Some(json!({"done": true})));
    }

    #[tokio::test]
    async fn listing_is_scoped_to_owner() {
        let (_, orchestrator) = orchestrator();
        for owner in ["a", "a", "b"] {
            orchestrator
                .create(TaskKind::Cleanup, owner, Map::new())
                .await
                .unwrap();
        }
        orchestrator
            .create(TaskKind::BatchEmbedding, "a", Map::new())
            .await
            .unwrap();

        assert_eq!(orchestrator.list_for_owner("a", None, None).await.unwrap().len(), 3);
        assert_eq!(
            orchestrator
                .list_for_owner("a", Some(TaskKind::Cleanup), None)
                .await
                .unwrap()
                .len(),
            2
        );
        assert_eq!(orchestrator.list_for_owner("a", None, Some(1)).await.unwrap().len(), 1);
    }
}
