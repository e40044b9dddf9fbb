use chrono::{DateTime, Utc};
use tokio_postgres::types::Json;
use tracing::instrument;

use crate::db::PgPool;
use crate::db::util::{TimedClientExt, get};
use crate::matching::pipeline::{CandidateRanking, SearchCacheEntry};
use crate::matching::weights::MatchWeights;
use crate::store::StoreError;

#[instrument(skip(pool, entry), fields(session_id = %entry.session_id, job_id = %entry.job_id))]
pub async fn put_entry(pool: &PgPool, entry: &SearchCacheEntry) -> Result<(), StoreError> {
    let client = pool.get().await?;
    let weights = serde_json::to_value(entry.weights_used)?;
    let rankings = serde_json::to_value(&entry.candidate_rankings)?;
    client
        .timed_execute_cached(
            "INSERT INTO jm.search_cache
                (session_id, job_id, \"timestamp\", weights_used, candidate_rankings)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (session_id, job_id) DO UPDATE SET
                \"timestamp\" = EXCLUDED.\"timestamp\",
                weights_used = EXCLUDED.weights_used,
                candidate_rankings = EXCLUDED.candidate_rankings",
            &[
                &entry.session_id,
                &entry.job_id,
                &entry.timestamp,
                &Json(&weights),
                &Json(&rankings),
            ],
            "search_cache.put",
        )
        .await?;
    Ok(())
}

/// Expired entries read as missing; they stay in the table until cleanup.
#[instrument(skip(pool))]
pub async fn get_entry(
    pool: &PgPool,
    session_id: &str,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<SearchCacheEntry>, StoreError> {
    let client = pool.get().await?;
    let row = client
        .timed_query_opt_cached(
            "SELECT session_id, job_id, \"timestamp\", weights_used, candidate_rankings
             FROM jm.search_cache
             WHERE session_id = $1 AND job_id = $2",
            &[&session_id, &job_id],
            "search_cache.get",
        )
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let Json(weights): Json<MatchWeights> = get(&row, "weights_used")?;
    let Json(rankings): Json<Vec<CandidateRanking>> = get(&row, "candidate_rankings")?;
    let entry = SearchCacheEntry {
        session_id: get(&row, "session_id")?,
        job_id: get(&row, "job_id")?,
        timestamp: get(&row, "timestamp")?,
        weights_used: weights,
        candidate_rankings: rankings,
    };
    Ok((!entry.is_expired(now)).then_some(entry))
}

#[instrument(skip(pool))]
pub async fn delete_before(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
    let client = pool.get().await?;
    let deleted = client
        .timed_execute_cached(
            "DELETE FROM jm.search_cache WHERE \"timestamp\" < $1",
            &[&cutoff],
            "search_cache.delete_before",
        )
        .await?;
    Ok(deleted)
}
