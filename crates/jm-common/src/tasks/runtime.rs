use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::handlers::{self, Services};
use super::record::{TaskRecord, TaskStatus, TaskUpdate};
use crate::logging::task_span;
use crate::store::{SharedStore, StoreError, TaskStore};

#[derive(Debug, Error)]
pub enum TaskError {
    /// Transient; the runtime schedules another attempt while the kind's
    /// retry policy allows it.
    #[error("{message}")]
    Retryable { message: String },
    #[error("{message}")]
    Permanent { message: String },
    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        Self::retryable(err.to_string())
    }
}

/// A request payload that does not deserialize will never succeed.
impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(format!("invalid task request: {err}"))
    }
}

/// Handle passed to a running task body.
#[derive(Clone)]
pub struct TaskContext {
    task_id: String,
    store: SharedStore,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: impl Into<String>, store: SharedStore, cancel: CancellationToken) -> Self {
        Self {
            task_id: task_id.into(),
            store,
            cancel,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Report a milestone. Doubles as the cancellation checkpoint: a
    /// cancelled token, or a record that went terminal under us, ends the
    /// task with [`TaskError::Cancelled`]. Store failures only lose the
    /// progress update.
    pub async fn progress(&self, progress: u8, message: &str) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        match self
            .store
            .update_task(&self.task_id, &TaskUpdate::progress(progress, message))
            .await
        {
            Ok(true) => {
                debug!(task_id = %self.task_id, progress, message, "task progress");
                Ok(())
            }
            Ok(false) => {
                self.cancel.cancel();
                Err(TaskError::Cancelled)
            }
            Err(e) => {
                warn!(task_id = %self.task_id, progress, error = %e, "failed to persist progress");
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct RuntimeEntry {
    token: CancellationToken,
    outcome: Option<TaskUpdate>,
}

/// In-process view of running and recently finished tasks. The orchestrator
/// consults it when the persisted record lags behind the worker.
#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    entries: Mutex<HashMap<String, RuntimeEntry>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RuntimeEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `task_id` and hand out its cancellation token.
    pub fn register(&self, task_id: &str) -> CancellationToken {
        self.lock()
            .entry(task_id.to_string())
            .or_default()
            .token
            .clone()
    }

    /// Signal a running task. Returns whether this process is running it.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.lock().get(task_id) {
            Some(entry) if entry.outcome.is_none() => {
                entry.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Remember an outcome (terminal or a scheduled retry) that could not be
    /// written to the store. [`RuntimeRegistry::cancel`] ignores the entry
    /// from then on.
    pub fn finish(&self, task_id: &str, outcome: TaskUpdate) {
        self.lock().entry(task_id.to_string()).or_default().outcome = Some(outcome);
    }

    pub fn outcome(&self, task_id: &str) -> Option<TaskUpdate> {
        self.lock().get(task_id).and_then(|entry| entry.outcome.clone())
    }

    pub fn forget(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub idle_poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: crate::run_id::worker_tag("jm-worker"),
            concurrency: 4,
            idle_poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Claims queued tasks from the store and runs them, at most `concurrency`
/// at a time.
pub struct WorkerPool {
    services: Services,
    registry: Arc<RuntimeRegistry>,
    notify: Arc<Notify>,
    slots: Arc<Semaphore>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        services: Services,
        registry: Arc<RuntimeRegistry>,
        notify: Arc<Notify>,
        config: WorkerPoolConfig,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            services,
            registry,
            notify,
            slots: Arc::new(Semaphore::new(concurrency)),
            config: WorkerPoolConfig {
                concurrency,
                ..config
            },
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Claim one task and run it to completion on the current task.
    /// `Ok(None)` when nothing is claimable.
    pub async fn run_once(&self) -> Result<Option<TaskStatus>, StoreError> {
        let Some(record) = self
            .services
            .store
            .claim_next_task(&self.config.worker_id, Utc::now())
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(
            execute(self.services.clone(), self.registry.clone(), record).await,
        ))
    }

    /// Run until `shutdown` fires, then wait for in-flight tasks.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "worker pool started"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = self
                .services
                .store
                .claim_next_task(&self.config.worker_id, Utc::now())
                .await;

            match claimed {
                Ok(Some(record)) => {
                    let services = self.services.clone();
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        execute(services, registry, record).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.idle(&shutdown).await;
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "failed to claim task");
                    self.idle(&shutdown).await;
                }
            }
        }

        let slots = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        if self.slots.acquire_many(slots).await.is_ok() {
            info!(worker_id = %self.config.worker_id, "worker pool drained");
        }
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
        }
    }
}

/// Run one claimed task and persist its outcome. Returns the status the
/// record should now be in.
async fn execute(services: Services, registry: Arc<RuntimeRegistry>, record: TaskRecord) -> TaskStatus {
    let task_id = record.task_id.clone();
    let kind = record.kind;
    let token = registry.register(&task_id);
    let ctx = TaskContext::new(task_id.clone(), services.store.clone(), token);
    let started = Instant::now();

    info!(task_id = %task_id, kind = kind.as_str(), attempt = record.retry_count + 1, "task started");

    // 別タスクで実行して panic も failure として記録する
    let body = {
        let services = services.clone();
        let record = record.clone();
        let span = task_span(
            &record.task_id,
            record.kind.as_str(),
            record.locked_by.as_deref().unwrap_or("-"),
        );
        tokio::spawn(async move { handlers::run(&services, &ctx, &record).await }.instrument(span))
    };
    let outcome = match body.await {
        Ok(outcome) => outcome,
        Err(join_err) => Err(TaskError::permanent(format!("task panicked: {join_err}"))),
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let now = Utc::now();
    let policy = kind.retry_policy();

    let update = match outcome {
        Ok(result) => {
            info!(task_id = %task_id, kind = kind.as_str(), elapsed_ms, "task succeeded");
            TaskUpdate::success(result, now)
        }
        Err(TaskError::Cancelled) => {
            info!(task_id = %task_id, kind = kind.as_str(), elapsed_ms, "task cancelled");
            registry.forget(&task_id);
            return TaskStatus::Revoked;
        }
        Err(TaskError::Retryable { message }) if policy.allows_retry(record.retry_count) => {
            let attempt = record.retry_count + 1;
            let next_retry_at = now + policy.backoff(attempt);
            warn!(
                task_id = %task_id,
                kind = kind.as_str(),
                attempt,
                max_retries = policy.max_retries,
                %next_retry_at,
                error = %message,
                "task failed; retry scheduled"
            );
            TaskUpdate::retry(message, attempt, next_retry_at)
        }
        Err(err) => {
            error!(task_id = %task_id, kind = kind.as_str(), elapsed_ms, error = %err, "task failed");
            TaskUpdate::failure(err.to_string(), now)
        }
    };

    let status = update.status.unwrap_or(TaskStatus::Failure);
    match services.store.update_task(&task_id, &update).await {
        Ok(true) => {
            registry.forget(&task_id);
            status
        }
        Ok(false) => {
            info!(task_id = %task_id, "task was revoked while running; outcome dropped");
            registry.forget(&task_id);
            TaskStatus::Revoked
        }
        Err(e) => {
            error!(task_id = %task_id, status = status.as_str(), error = %e, "failed to persist task outcome");
            registry.finish(&task_id, update);
            status
        }
    }
}

/// Shape of a successful task result as exposed through the status record.
pub type TaskResult = Result<Value, TaskError>;
