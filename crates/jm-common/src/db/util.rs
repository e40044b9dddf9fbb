#![allow(async_fn_in_trait)]

use deadpool_postgres::GenericClient;
use serde_json::Value;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio_postgres::types::{Json, ToSql};
use tokio_postgres::Row;
use tracing::warn;

use crate::store::StoreError;

/// Convert an optional JSON value into a Postgres-compatible wrapper.
pub fn normalize_json(value: &Option<Value>) -> Option<Json<&Value>> {
    value.as_ref().map(Json)
}

/// Parse a TEXT column holding an enum tag.
pub fn parse_tag<T: FromStr>(column: &str, raw: &str) -> Result<T, StoreError> {
    T::from_str(raw).map_err(|_| StoreError::Mapping(format!("unknown {column}: {raw}")))
}

/// Postgres has no unsigned types; counters are stored as INTEGER.
pub fn to_u32(column: &str, raw: i32) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|e| StoreError::Mapping(format!("{column}: {e}")))
}

pub fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub fn get<'a, T>(row: &'a Row, column: &str) -> Result<T, StoreError>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get(column).map_err(StoreError::from)
}

pub const SLOW_QUERY_ENV: &str = "JM_DB_LOG_MIN_DURATION_MS";

fn parse_threshold(raw: Option<&str>) -> Option<Duration> {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn slow_query_threshold() -> Option<Duration> {
    static CACHE: OnceLock<Option<Duration>> = OnceLock::new();
    *CACHE.get_or_init(|| parse_threshold(std::env::var(SLOW_QUERY_ENV).ok().as_deref()))
}

/// Await a statement and warn when it took longer than the slow-query
/// threshold.
async fn timed<T>(
    label: &str,
    statement: impl Future<Output = Result<T, tokio_postgres::Error>>,
) -> Result<T, tokio_postgres::Error> {
    let started = Instant::now();
    let result = statement.await;
    if let Some(threshold) = slow_query_threshold() {
        let elapsed = started.elapsed();
        if elapsed >= threshold {
            warn!(
                query = label,
                elapsed_ms = elapsed.as_millis() as u64,
                ok = result.is_ok(),
                "slow query"
            );
        }
    }
    result
}

/// Prepared-statement-cached calls, timed under a call-site label.
pub trait TimedClientExt: GenericClient {
    async fn timed_query_cached(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
        label: &str,
    ) -> Result<Vec<Row>, tokio_postgres::Error> {
        timed(label, async {
            let prepared = self.prepare_cached(statement).await?;
            self.query(&prepared, params).await
        })
        .await
    }

    async fn timed_query_opt_cached(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
        label: &str,
    ) -> Result<Option<Row>, tokio_postgres::Error> {
        timed(label, async {
            let prepared = self.prepare_cached(statement).await?;
            self.query_opt(&prepared, params).await
        })
        .await
    }

    async fn timed_query_one_cached(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
        label: &str,
    ) -> Result<Row, tokio_postgres::Error> {
        timed(label, async {
            let prepared = self.prepare_cached(statement).await?;
            self.query_one(&prepared, params).await
        })
        .await
    }

    async fn timed_execute_cached(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
        label: &str,
    ) -> Result<u64, tokio_postgres::Error> {
        timed(label, async {
            let prepared = self.prepare_cached(statement).await?;
            self.execute(&prepared, params).await
        })
        .await
    }
}

impl<T: GenericClient + ?Sized> TimedClientExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::record::TaskStatus;

    #[test]
    fn normalize_json_handles_options() {
        let none: Option<Value> = None;
        assert!(normalize_json(&none).is_none());

        let some = Some(serde_json::json!({"progress": 40}));
        assert!(normalize_json(&some).is_some());
    }

    #[test]
    fn parse_tag_reports_column() {
        let status: TaskStatus = parse_tag("status", "retry").unwrap();
        assert_eq!(status, TaskStatus::Retry);

        let err = parse_tag::<TaskStatus>("status", "queued").unwrap_err();
        assert_eq!(err.to_string(), "row mapping error: unknown status: queued");
    }

    #[test]
    fn slow_query_threshold_ignores_zero_and_garbage() {
        assert_eq!(parse_threshold(Some("250")), Some(Duration::from_millis(250)));
        assert_eq!(parse_threshold(Some("0")), None);
        assert_eq!(parse_threshold(Some("-5")), None);
        assert_eq!(parse_threshold(Some("fast")), None);
        assert_eq!(parse_threshold(None), None);
    }

    #[test]
    fn negative_counters_are_rejected() {
        assert_eq!(to_u32("retry_count", 2).unwrap(), 2);
        assert!(to_u32("retry_count", -1).is_err());
        assert_eq!(limit_param(usize::MAX), i64::MAX);
    }
}
