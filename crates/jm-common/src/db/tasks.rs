use chrono::{DateTime, Utc};
use deadpool_postgres::Transaction;
use serde_json::{Map, Value};
use tokio_postgres::Row;
use tokio_postgres::types::Json;
use tracing::{debug, instrument};

use crate::db::PgPool;
use crate::db::util::{TimedClientExt, get, limit_param, normalize_json, parse_tag, to_u32};
use crate::store::StoreError;
use crate::tasks::record::{TaskKind, TaskRecord, TaskUpdate};

const COLUMNS: &str = "task_id, task_type, status, progress, result, error, created_at, \
                       started_at, completed_at, updated_at, created_by, metadata, \
                       retry_count, next_retry_at, locked_by";

#[instrument(skip(pool, task), fields(task_id = %task.task_id, kind = task.kind.as_str()))]
pub async fn insert_task(pool: &PgPool, task: &TaskRecord) -> Result<(), StoreError> {
    let client = pool.get().await?;
    let metadata = Value::Object(task.metadata.clone());
    let progress = i16::from(task.progress);
    let retry_count = i32::try_from(task.retry_count).unwrap_or(i32::MAX);
    client
        .timed_execute_cached(
            "INSERT INTO jm.task_status
                (task_id, task_type, status, progress, result, error, created_at,
                 started_at, completed_at, updated_at, created_by, metadata,
                 retry_count, next_retry_at, locked_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            &[
                &task.task_id,
                &task.kind.as_str(),
                &task.status.as_str(),
                &progress,
                &normalize_json(&task.result),
                &task.error,
                &task.created_at,
                &task.started_at,
                &task.completed_at,
                &task.updated_at,
                &task.owner,
                &Json(&metadata),
                &retry_count,
                &task.next_retry_at,
                &task.locked_by,
            ],
            "tasks.insert",
        )
        .await?;
    Ok(())
}

#[instrument(skip(pool))]
pub async fn fetch_task(pool: &PgPool, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
    let client = pool.get().await?;
    let sql = format!("SELECT {COLUMNS} FROM jm.task_status WHERE task_id = $1");
    let row = client
        .timed_query_opt_cached(&sql, &[&task_id], "tasks.fetch")
        .await?;
    row.map(|r| row_to_task(&r)).transpose()
}

/// Read-modify-write under a row lock. Terminal records are left untouched,
/// which is how a cancel wins over a late success from another worker.
#[instrument(skip(pool, update))]
pub async fn update_task(
    pool: &PgPool,
    task_id: &str,
    update: &TaskUpdate,
) -> Result<bool, StoreError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let sql = format!("SELECT {COLUMNS} FROM jm.task_status WHERE task_id = $1 FOR UPDATE");
    let Some(row) = tx.timed_query_opt_cached(&sql, &[&task_id], "tasks.lock").await? else {
        return Ok(false);
    };
    let mut record = row_to_task(&row)?;
    if record.status.is_terminal() {
        debug!(status = record.status.as_str(), "task already terminal; update dropped");
        return Ok(false);
    }

    record.apply(update, Utc::now());
    write_back(&tx, &record).await?;
    tx.commit().await?;
    Ok(true)
}

async fn write_back(client: &Transaction<'_>, record: &TaskRecord) -> Result<(), StoreError> {
    let metadata = Value::Object(record.metadata.clone());
    let progress = i16::from(record.progress);
    let retry_count = i32::try_from(record.retry_count).unwrap_or(i32::MAX);
    client
        .timed_execute_cached(
            "UPDATE jm.task_status SET
                status = $2,
                progress = $3,
                result = $4,
                error = $5,
                started_at = $6,
                completed_at = $7,
                updated_at = $8,
                metadata = $9,
                retry_count = $10,
                next_retry_at = $11,
                locked_by = $12
             WHERE task_id = $1",
            &[
                &record.task_id,
                &record.status.as_str(),
                &progress,
                &normalize_json(&record.result),
                &record.error,
                &record.started_at,
                &record.completed_at,
                &record.updated_at,
                &Json(&metadata),
                &retry_count,
                &record.next_retry_at,
                &record.locked_by,
            ],
            "tasks.write_back",
        )
        .await?;
    Ok(())
}

/// Lock and return the oldest claimable task. Concurrent workers skip rows
/// another worker is already claiming.
#[instrument(skip(pool))]
pub async fn claim_next_task(
    pool: &PgPool,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<TaskRecord>, StoreError> {
    let client = pool.get().await?;
    let sql = format!(
        "UPDATE jm.task_status
SET
    status = 'started',
    progress = 5,
    started_at = $2,
    updated_at = $2,
    next_retry_at = NULL,
    locked_by = $1
WHERE task_id = (
    SELECT task_id
    FROM jm.task_status
    WHERE status = 'pending'
       OR (status = 'retry' AND (next_retry_at IS NULL OR next_retry_at <= $2))
    ORDER BY created_at, task_id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING {COLUMNS}"
    );
    let row = client
        .timed_query_opt_cached(&sql, &[&worker_id, &now], "tasks.claim_next")
        .await?;
    row.map(|r| row_to_task(&r)).transpose()
}

#[instrument(skip(pool))]
pub async fn list_for_owner(
    pool: &PgPool,
    owner: &str,
    kind: Option<TaskKind>,
    limit: usize,
) -> Result<Vec<TaskRecord>, StoreError> {
    let client = pool.get().await?;
    let kind = kind.map(|k| k.as_str().to_string());
    let sql = format!(
        "SELECT {COLUMNS} FROM jm.task_status
         WHERE created_by = $1 AND ($2::TEXT IS NULL OR task_type = $2)
         ORDER BY created_at DESC, task_id DESC
         LIMIT $3"
    );
    let rows = client
        .timed_query_cached(&sql, &[&owner, &kind, &limit_param(limit)], "tasks.list_for_owner")
        .await?;
    rows.iter().map(row_to_task).collect()
}

#[instrument(skip(pool))]
pub async fn delete_created_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let client = pool.get().await?;
    let deleted = client
        .timed_execute_cached(
            "DELETE FROM jm.task_status WHERE created_at < $1",
            &[&cutoff],
            "tasks.delete_created_before",
        )
        .await?;
    Ok(deleted)
}

/// Put tasks a dead worker left mid-flight back on the queue.
#[instrument(skip(pool))]
pub async fn requeue_incomplete(pool: &PgPool) -> Result<u64, StoreError> {
    let client = pool.get().await?;
    let requeued = client
        .timed_execute_cached(
            "UPDATE jm.task_status SET
                status = 'pending',
                locked_by = NULL,
                next_retry_at = NULL,
                updated_at = NOW()
             WHERE status IN ('started', 'progress')",
            &[],
            "tasks.requeue_incomplete",
        )
        .await?;
    Ok(requeued)
}

fn row_to_task(row: &Row) -> Result<TaskRecord, StoreError> {
    let kind: String = get(row, "task_type")?;
    let status: String = get(row, "status")?;
    let progress: i16 = get(row, "progress")?;
    let Json(metadata): Json<Value> = get(row, "metadata")?;
    let metadata = match metadata {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(StoreError::Mapping(format!(
                "metadata must be an object, got {other}"
            )));
        }
    };
    let result: Option<Json<Value>> = get(row, "result")?;

    Ok(TaskRecord {
        task_id: get(row, "task_id")?,
        kind: parse_tag("task_type", &kind)?,
        status: parse_tag("status", &status)?,
        progress: u8::try_from(progress.clamp(0, 100)).unwrap_or(100),
        result: result.map(|Json(v)| v),
        error: get(row, "error")?,
        created_at: get(row, "created_at")?,
        started_at: get(row, "started_at")?,
        completed_at: get(row, "completed_at")?,
        updated_at: get(row, "updated_at")?,
        owner: get(row, "created_by")?,
        metadata,
        retry_count: to_u32("retry_count", get(row, "retry_count")?)?,
        next_retry_at: get(row, "next_retry_at")?,
        locked_by: get(row, "locked_by")?,
    })
}
