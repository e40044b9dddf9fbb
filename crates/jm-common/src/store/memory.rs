use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{
    CandidateStore, InteractionStore, JobStore, KindStats, MAX_INTERACTION_ROWS,
    SearchCacheStore, StoreError, TaskStore, WeightsStore,
};
use crate::matching::pipeline::SearchCacheEntry;
use crate::ranking::interaction::{InteractionKind, RecruiterInteraction};
use crate::ranking::learning_weights::LearningWeights;
use crate::tasks::record::{TaskKind, TaskRecord, TaskStatus, TaskUpdate};
use crate::{Candidate, JobPosting};

/// In-process store. Collections keep insertion order like the document
/// store does.
#[derive(Debug, Default)]
pub struct MemoryStore {
    candidates: RwLock<Vec<Candidate>>,
    jobs: RwLock<Vec<JobPosting>>,
    interactions: RwLock<Vec<RecruiterInteraction>>,
    weights: RwLock<Vec<LearningWeights>>,
    tasks: RwLock<HashMap<String, TaskRecord>>,
    search_cache: RwLock<HashMap<(String, String), SearchCacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn upsert_by<T, F>(rows: &mut Vec<T>, row: T, same: F)
where
    F: Fn(&T) -> bool,
{
    match rows.iter_mut().find(|existing| same(existing)) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

#[async_trait]
impl CandidateStore for MemoryStore {
    async fn insert_candidate(&self, candidate: &Candidate) -> Result<(), StoreError> {
        let mut rows = self.candidates.write().await;
        upsert_by(&mut rows, candidate.clone(), |c| c.id == candidate.id);
        Ok(())
    }

    async fn get_candidate(&self, id: &str) -> Result<Option<Candidate>, StoreError> {
        Ok(self.candidates.read().await.iter().find(|c| c.id == id).cloned())
    }

    async fn list_candidates(&self, limit: usize) -> Result<Vec<Candidate>, StoreError> {
        Ok(self.candidates.read().await.iter().take(limit).cloned().collect())
    }

    async fn update_candidate_embedding(&self, id: &str, embedding: &[f32]) -> Result<bool, StoreError> {
        let mut rows = self.candidates.write().await;
        Ok(match rows.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.embedding = embedding.to_vec();
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &JobPosting) -> Result<(), StoreError> {
        let mut rows = self.jobs.write().await;
        upsert_by(&mut rows, job.clone(), |j| j.id == job.id);
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobPosting>, StoreError> {
        Ok(self.jobs.read().await.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobPosting>, StoreError> {
        Ok(self.jobs.read().await.iter().take(limit).cloned().collect())
    }

    async fn update_job_embedding(&self, id: &str, embedding: &[f32]) -> Result<bool, StoreError> {
        let mut rows = self.jobs.write().await;
        Ok(match rows.iter_mut().find(|j| j.id == id) {
            Some(j) => {
                j.embedding = embedding.to_vec();
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl InteractionStore for MemoryStore {
    async fn insert_interaction(&self, interaction: &RecruiterInteraction) -> Result<(), StoreError> {
        self.interactions.write().await.push(interaction.clone());
        Ok(())
    }

    async fn count_interactions(&self) -> Result<i64, StoreError> {
        Ok(self.interactions.read().await.len() as i64)
    }

    async fn count_interactions_since(&self, cutoff: DateTime<Utc>) -> Result<i64, StoreError> {
        Ok(self
            .interactions
            .read()
            .await
            .iter()
            .filter(|i| i.timestamp >= cutoff)
            .count() as i64)
    }

    async fn list_interactions_since(
        &self,
        cutoff: DateTime<Utc>,
        recruiter_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RecruiterInteraction>, StoreError> {
        let rows = self.interactions.read().await;
        let mut matching: Vec<RecruiterInteraction> = rows
            .iter()
            .filter(|i| i.timestamp >= cutoff)
            .filter(|i| recruiter_id.is_none_or(|r| i.recruiter_id == r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit.min(MAX_INTERACTION_ROWS));
        Ok(matching)
    }

    async fn interaction_stats_by_kind(&self) -> Result<Vec<KindStats>, StoreError> {
        let rows = self.interactions.read().await;
        let mut acc: HashMap<InteractionKind, (i64, f64)> = HashMap::new();
        for interaction in rows.iter() {
            let entry = acc.entry(interaction.kind).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += interaction.effective_reward();
        }
        Ok(InteractionKind::ALL
            .iter()
            .filter_map(|kind| {
                acc.get(kind).map(|(count, sum)| KindStats {
                    kind: *kind,
                    count: *count,
                    avg_reward: sum / *count as f64,
                })
            })
            .collect())
    }
}

#[async_trait]
impl WeightsStore for MemoryStore {
    async fn insert_weights(&self, weights: &LearningWeights) -> Result<(), StoreError> {
        self.weights.write().await.push(weights.clone());
        Ok(())
    }

    async fn latest_weights(
        &self,
        job_category: Option<&str>,
        recruiter_id: Option<&str>,
    ) -> Result<Option<LearningWeights>, StoreError> {
        let rows = self.weights.read().await;
        // 同時刻なら後から追加したレコードを優先（max_by_key は最後の最大値を返す）
        Ok(rows
            .iter()
            .filter(|w| job_category.is_none_or(|c| w.job_category.as_deref() == Some(c)))
            .filter(|w| recruiter_id.is_none_or(|r| w.recruiter_id.as_deref() == Some(r)))
            .max_by_key(|w| w.last_updated)
            .cloned())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        self.tasks
            .write()
            .await
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(record) if !record.status.is_terminal() => {
                record.apply(update, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut tasks = self.tasks.write().await;
        let next = tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.task_id.cmp(&b.task_id))
            })
            .map(|t| t.task_id.clone());

        Ok(next.and_then(|id| {
            tasks.get_mut(&id).map(|record| {
                record.apply(&TaskUpdate::claimed(worker_id, now), now);
                record.clone()
            })
        }))
    }

    async fn list_tasks_for_owner(
        &self,
        owner: &str,
        kind: Option<TaskKind>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut rows: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.owner == owner)
            .filter(|t| kind.is_none_or(|k| t.kind == k))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.task_id.cmp(&a.task_id))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn delete_tasks_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| t.created_at >= cutoff);
        Ok((before - tasks.len()) as u64)
    }

    async fn requeue_incomplete_tasks(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().await;
        let mut requeued = 0;
        for record in tasks.values_mut() {
            if matches!(record.status, TaskStatus::Started | TaskStatus::Progress) {
                record.apply(&TaskUpdate::requeued(), now);
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[async_trait]
impl SearchCacheStore for MemoryStore {
    async fn put_search_cache(&self, entry: &SearchCacheEntry) -> Result<(), StoreError> {
        self.search_cache.write().await.insert(
            (entry.session_id.clone(), entry.job_id.clone()),
            entry.clone(),
        );
        Ok(())
    }

    async fn get_search_cache(
        &self,
        session_id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SearchCacheEntry>, StoreError> {
        let cache = self.search_cache.read().await;
        Ok(cache
            .get(&(session_id.to_string(), job_id.to_string()))
            .filter(|entry| !entry.is_expired(now))
            .cloned())
    }

    async fn delete_search_cache_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut cache = self.search_cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.timestamp >= cutoff);
        Ok((before - cache.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::pipeline::SEARCH_CACHE_TTL_MINUTES;
    use crate::matching::weights::DEFAULT_WEIGHTS;
    use chrono::Duration;
    use serde_json::Map;

    fn task(id: &str, owner: &str, created_at: DateTime<Utc>) -> TaskRecord {
        TaskRecord::new(id.into(), TaskKind::Cleanup, owner, Map::new(), created_at)
    }

    #[tokio::test]
    async fn terminal_tasks_refuse_updates() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_task(&task("t", "u", now)).await.unwrap();

        assert!(store
            .update_task("t", &TaskUpdate::success(serde_json::json!({}), now))
            .await
            .unwrap());
        assert!(!store
            .update_task("t", &TaskUpdate::failure("late", now))
            .await
            .unwrap());
        assert!(!store
            .update_task("missing", &TaskUpdate::requeued())
            .await
            .unwrap());

        let record = store.get_task("t").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(record.error, None);
    }

    #[tokio::test]
    async fn claims_oldest_pending_first() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_task(&task("newer", "u", now))
            .await
            .unwrap();
        store
            .insert_task(&task("older", "u", now - Duration::seconds(5)))
            .await
            .unwrap();

        let first = store.claim_next_task("w", now).await.unwrap().unwrap();
        let second = store.claim_next_task("w", now).await.unwrap().unwrap();

        assert_eq!(first.task_id, "older");
        assert_eq!(first.status, TaskStatus::Started);
        assert_eq!(first.locked_by.as_deref(), Some("w"));
        assert_eq!(second.task_id, "newer");
        assert!(store.claim_next_task("w", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeue_returns_running_tasks_to_pending() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_task(&task("t", "u", now)).await.unwrap();
        store.claim_next_task("w", now).await.unwrap();

        assert_eq!(store.requeue_incomplete_tasks().await.unwrap(), 1);
        let record = store.get_task("t").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.locked_by, None);
    }

    #[tokio::test]
    async fn interactions_list_newest_first_with_filter() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (i, recruiter) in ["a", "b", "a"].iter().enumerate() {
            let interaction =
                RecruiterInteraction::new(*recruiter, format!("c{i}"), "j", InteractionKind::Click)
                    .at(now - Duration::minutes(i as i64));
            store.insert_interaction(&interaction).await.unwrap();
        }
        let old = RecruiterInteraction::new("a", "old", "j", InteractionKind::Hire)
            .at(now - Duration::days(40));
        store.insert_interaction(&old).await.unwrap();

        let recent = store
            .list_interactions_since(now - Duration::days(30), Some("a"), 100)
            .await
            .unwrap();

        let ids: Vec<_> = recent.iter().map(|i| i.candidate_id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c2"]);
        assert_eq!(store.count_interactions().await.unwrap(), 4);
        assert_eq!(
            store
                .count_interactions_since(now - Duration::days(1))
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn stats_group_by_kind() {
        let store = MemoryStore::new();
        for kind in [InteractionKind::Click, InteractionKind::Click, InteractionKind::Reject] {
            store
                .insert_interaction(&RecruiterInteraction::new("r", "c", "j", kind))
                .await
                .unwrap();
        }

        let stats = store.interaction_stats_by_kind().await.unwrap();

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].kind, InteractionKind::Click);
        assert_eq!(stats[0].count, 2);
        assert!((stats[0].avg_reward - 0.1).abs() < 1e-12);
        assert_eq!(stats[1].avg_reward, -0.5);
    }

    #[tokio::test]
    async fn latest_weights_respects_scope() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut general = LearningWeights::from_weights(DEFAULT_WEIGHTS, 0.5, 60);
        general.last_updated = now - Duration::hours(2);
        let mut data = LearningWeights::from_weights(DEFAULT_WEIGHTS, 0.6, 70);
        data.job_category = Some("Data Engineer".into());
        data.last_updated = now - Duration::hours(1);
        store.insert_weights(&general).await.unwrap();
        store.insert_weights(&data).await.unwrap();

        let any = store.latest_weights(None, None).await.unwrap().unwrap();
        let scoped = store
            .latest_weights(Some("Data Engineer"), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(any.id, data.id);
        assert_eq!(scoped.id, data.id);
        assert!(store
            .latest_weights(Some("Designer"), None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_cache_entries_read_as_missing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let entry = SearchCacheEntry::from_matches("s", "j", DEFAULT_WEIGHTS, &[], now);
        store.put_search_cache(&entry).await.unwrap();

        assert!(store.get_search_cache("s", "j", now).await.unwrap().is_some());
        assert!(store
            .get_search_cache("s", "j", now + Duration::minutes(SEARCH_CACHE_TTL_MINUTES))
            .await
            .unwrap()
            .is_none());

        let removed = store
            .delete_search_cache_before(now + Duration::hours(3))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
