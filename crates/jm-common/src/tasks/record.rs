use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, EnumString};

/// Metadata key holding the serialized request arguments.
pub const REQUEST_KEY: &str = "request";
/// Metadata key holding the last progress message.
pub const PROGRESS_MESSAGE_KEY: &str = "progress_message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Started,
    Progress,
    Success,
    Failure,
    Revoked,
    Retry,
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskKind {
    ResumeProcessing,
    CandidateSearch,
    BulkMatching,
    BatchEmbedding,
    EmbeddingRegeneration,
    ModelRetraining,
    PeriodicRetrain,
    Cleanup,
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    pub fn retry_policy(self) -> RetryPolicy {
        match self {
            TaskKind::ResumeProcessing => RetryPolicy::new(3, 60),
            TaskKind::CandidateSearch => RetryPolicy::new(2, 30),
            TaskKind::BatchEmbedding => RetryPolicy::new(3, 30),
            TaskKind::EmbeddingRegeneration => RetryPolicy::new(2, 60),
            TaskKind::ModelRetraining => RetryPolicy::new(2, 120),
            TaskKind::BulkMatching | TaskKind::PeriodicRetrain | TaskKind::Cleanup => {
                RetryPolicy::NONE
            }
        }
    }
}

/// Automatic retry bound and exponential backoff for one task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_secs: i64,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy::new(0, 0);

    pub const fn new(max_retries: u32, backoff_base_secs: i64) -> Self {
        Self {
            max_retries,
            backoff_base_secs,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1i64 << attempt.saturating_sub(1).min(20);
        Duration::seconds(self.backoff_base_secs.saturating_mul(factor))
    }

    pub fn allows_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(rename = "task_type")]
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "created_by")]
    pub owner: String,
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub locked_by: Option<String>,
}

impl TaskRecord {
    pub fn new(
        task_id: String,
        kind: TaskKind,
        owner: impl Into<String>,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            kind,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            owner: owner.into(),
            metadata,
            retry_count: 0,
            next_retry_at: None,
            locked_by: None,
        }
    }

    /// Request arguments stored at submission.
    pub fn request<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let raw = self.metadata.get(REQUEST_KEY).cloned().unwrap_or(Value::Null);
        serde_json::from_value(raw)
    }

    pub fn progress_message(&self) -> Option<&str> {
        self.metadata
            .get(PROGRESS_MESSAGE_KEY)
            .and_then(Value::as_str)
    }

    /// Pending, or a retry whose backoff has elapsed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Retry => self.next_retry_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Linear extrapolation from elapsed time and progress. Only defined while
    /// the task reports progress above 10%.
    pub fn estimate_completion(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.status != TaskStatus::Progress || self.progress <= 10 {
            return None;
        }
        let started_at = self.started_at?;
        let elapsed = (now - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let estimated_total = elapsed / f64::from(self.progress) * 100.0;
        let remaining = estimated_total - elapsed;
        Some(now + Duration::milliseconds((remaining * 1000.0).round() as i64))
    }

    /// Apply a patch. Status transitions also maintain the bookkeeping
    /// columns: leaving `retry` clears `next_retry_at`, and the worker lock is
    /// released when the task goes back to the queue or finishes.
    pub fn apply(&mut self, update: &TaskUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
            if status != TaskStatus::Retry {
                self.next_retry_at = None;
            }
            if status.is_terminal() || matches!(status, TaskStatus::Pending | TaskStatus::Retry) {
                self.locked_by = None;
            }
        }
        if let Some(progress) = update.progress {
            self.progress = progress.min(100);
        }
        if let Some(result) = &update.result {
            self.result = Some(result.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if let Some(started_at) = update.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
        for (key, value) in &update.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(next_retry_at) = update.next_retry_at {
            self.next_retry_at = Some(next_retry_at);
        }
        if let Some(worker) = &update.locked_by {
            self.locked_by = Some(worker.clone());
        }
        self.updated_at = now;
    }
}

/// Partial update of a task record. `None` fields are left alone; metadata
/// keys are merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
    pub retry_count: Option<u32>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
}

impl TaskUpdate {
    pub fn claimed(worker_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Started),
            progress: Some(5),
            started_at: Some(now),
            locked_by: Some(worker_id.to_string()),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8, message: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert(PROGRESS_MESSAGE_KEY.into(), Value::String(message.into()));
        Self {
            status: Some(TaskStatus::Progress),
            progress: Some(progress),
            metadata,
            ..Default::default()
        }
    }

    pub fn success(result: Value, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Success),
            progress: Some(100),
            result: Some(result),
            completed_at: Some(now),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Failure),
            error: Some(error.into()),
            completed_at: Some(now),
            ..Default::default()
        }
    }

    pub fn revoked(reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Revoked),
            error: Some(reason.into()),
            completed_at: Some(now),
            ..Default::default()
        }
    }

    pub fn retry(error: impl Into<String>, retry_count: u32, next_retry_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Retry),
            error: Some(error.into()),
            retry_count: Some(retry_count),
            next_retry_at: Some(next_retry_at),
            ..Default::default()
        }
    }

    pub fn requeued() -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            ..Default::default()
        }
    }
}

/// Task record as returned to status-polling callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    #[serde(flatten)]
    pub record: TaskRecord,
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl TaskInfo {
    pub fn from_record(record: TaskRecord, now: DateTime<Utc>) -> Self {
        let estimated_completion = record.estimate_completion(now);
        Self {
            record,
            estimated_completion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    fn record(now: DateTime<Utc>) -> TaskRecord {
        TaskRecord::new("t-1".into(), TaskKind::CandidateSearch, "u-1", Map::new(), now)
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failure.is_terminal());
        assert!(TaskStatus::Revoked.is_terminal());
        assert!(!TaskStatus::Retry.is_terminal());
        assert!(!TaskStatus::Progress.is_terminal());
        assert_eq!(TaskStatus::from_str("revoked").unwrap(), TaskStatus::Revoked);
        assert_eq!(TaskKind::from_str("candidate_search").unwrap(), TaskKind::CandidateSearch);
    }

    #[test]
    fn search_retries_less_than_resume() {
        let search = TaskKind::CandidateSearch.retry_policy();
        let resume = TaskKind::ResumeProcessing.retry_policy();
        assert!(search.max_retries < resume.max_retries);
        assert_eq!(TaskKind::PeriodicRetrain.retry_policy().max_retries, 0);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = TaskKind::ResumeProcessing.retry_policy();
        assert_eq!(policy.backoff(1), Duration::seconds(60));
        assert_eq!(policy.backoff(2), Duration::seconds(120));
        assert_eq!(policy.backoff(3), Duration::seconds(240));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn eta_needs_progress_above_ten() {
        let now = Utc::now();
        let mut r = record(now - Duration::seconds(100));
        r.status = TaskStatus::Progress;
        r.started_at = Some(now - Duration::seconds(50));

        r.progress = 10;
        assert_eq!(r.estimate_completion(now), None);

        r.progress = 50;
        assert_eq!(r.estimate_completion(now), Some(now + Duration::seconds(50)));

        r.status = TaskStatus::Started;
        assert_eq!(r.estimate_completion(now), None);
    }

    #[test]
    fn apply_merges_metadata_and_releases_lock() {
        let now = Utc::now();
        let mut r = record(now);
        r.metadata.insert(REQUEST_KEY.into(), json!({"job_id": "j"}));

        r.apply(&TaskUpdate::claimed("w-1", now), now);
        assert_eq!(r.locked_by.as_deref(), Some("w-1"));
        assert_eq!(r.progress, 5);

        r.apply(&TaskUpdate::progress(40, "scoring"), now);
        assert_eq!(r.progress_message(), Some("scoring"));
        assert!(r.metadata.contains_key(REQUEST_KEY));

        r.apply(&TaskUpdate::success(json!({"ok": true}), now), now);
        assert_eq!(r.status, TaskStatus::Success);
        assert_eq!(r.progress, 100);
        assert_eq!(r.locked_by, None);
        assert_eq!(r.completed_at, Some(now));
    }

    #[test]
    fn retry_is_claimable_only_after_backoff() {
        let now = Utc::now();
        let mut r = record(now);
        r.apply(&TaskUpdate::retry("boom", 1, now + Duration::seconds(30)), now);

        assert!(!r.is_claimable(now));
        assert!(r.is_claimable(now + Duration::seconds(30)));
        assert_eq!(r.error.as_deref(), Some("boom"));
    }

    #[test]
    fn serializes_with_task_type_and_created_by() {
        let now = Utc::now();
        let info = TaskInfo::from_record(record(now), now);
        let value = serde_json::to_value(&info).unwrap();

        assert_eq!(value["task_type"], json!("candidate_search"));
        assert_eq!(value["created_by"], json!("u-1"));
        assert_eq!(value["status"], json!("pending"));
        assert!(value["estimated_completion"].is_null());
    }
}
