use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;

use super::Services;
use crate::store::{SearchCacheStore, TaskStore};
use crate::tasks::runtime::{TaskContext, TaskResult};

pub const TASK_RETENTION_DAYS: i64 = 7;
pub const SEARCH_CACHE_RETENTION_HOURS: i64 = 2;

pub async fn cleanup(services: &Services, ctx: &TaskContext) -> TaskResult {
    let now = Utc::now();

    ctx.progress(10, "Cleaning up old task records").await?;
    let cleaned_tasks = services
        .store
        .delete_tasks_created_before(now - Duration::days(TASK_RETENTION_DAYS))
        .await?;

    ctx.progress(50, "Cleaning up search cache").await?;
    let cleaned_cache = services
        .store
        .delete_search_cache_before(now - Duration::hours(SEARCH_CACHE_RETENTION_HOURS))
        .await?;

    info!(cleaned_tasks, cleaned_cache, "maintenance cleanup finished");
    Ok(json!({
        "status": "completed",
        "cleaned_tasks": cleaned_tasks,
        "cleaned_cache": cleaned_cache,
    }))
}
