use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use tracing::instrument;

use crate::db::PgPool;
use crate::db::util::{TimedClientExt, get, limit_param, parse_tag};
use crate::ranking::interaction::RecruiterInteraction;
use crate::store::{KindStats, MAX_INTERACTION_ROWS, StoreError};

/// `reward` is written resolved so aggregate queries can average it directly.
#[instrument(skip(pool, interaction), fields(kind = interaction.kind.as_ref()))]
pub async fn insert_interaction(
    pool: &PgPool,
    interaction: &RecruiterInteraction,
) -> Result<(), StoreError> {
    let client = pool.get().await?;
    let reward = interaction.effective_reward();
    client
        .timed_execute_cached(
            "INSERT INTO jm.recruiter_interactions
                (id, recruiter_id, candidate_id, job_id, interaction_type,
                 semantic_score, skill_overlap_score, experience_match_score,
                 original_score, search_position, reward, session_id, \"timestamp\")
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            &[
                &interaction.id,
                &interaction.recruiter_id,
                &interaction.candidate_id,
                &interaction.job_id,
                &interaction.kind.as_ref(),
                &interaction.semantic_score,
                &interaction.skill_overlap_score,
                &interaction.experience_match_score,
                &interaction.original_score,
                &interaction.search_position,
                &reward,
                &interaction.session_id,
                &interaction.timestamp,
            ],
            "interactions.insert",
        )
        .await?;
    Ok(())
}

#[instrument(skip(pool))]
pub async fn count_interactions(
    pool: &PgPool,
    since: Option<DateTime<Utc>>,
) -> Result<i64, StoreError> {
    let client = pool.get().await?;
    let row = client
        .timed_query_one_cached(
            "SELECT COUNT(*) AS total FROM jm.recruiter_interactions
             WHERE $1::TIMESTAMPTZ IS NULL OR \"timestamp\" >= $1",
            &[&since],
            "interactions.count",
        )
        .await?;
    get(&row, "total")
}

#[instrument(skip(pool))]
pub async fn list_interactions_since(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    recruiter_id: Option<&str>,
    limit: usize,
) -> Result<Vec<RecruiterInteraction>, StoreError> {
    let client = pool.get().await?;
    let limit = limit_param(limit.min(MAX_INTERACTION_ROWS));
    let rows = client
        .timed_query_cached(
            "SELECT id, recruiter_id, candidate_id, job_id, interaction_type,
                    semantic_score, skill_overlap_score, experience_match_score,
                    original_score, search_position, reward, session_id, \"timestamp\"
             FROM jm.recruiter_interactions
             WHERE \"timestamp\" >= $1
               AND ($2::TEXT IS NULL OR recruiter_id = $2)
             ORDER BY \"timestamp\" DESC
             LIMIT $3",
            &[&cutoff, &recruiter_id, &limit],
            "interactions.list_since",
        )
        .await?;
    rows.iter().map(row_to_interaction).collect()
}

#[instrument(skip(pool))]
pub async fn stats_by_kind(pool: &PgPool) -> Result<Vec<KindStats>, StoreError> {
    let client = pool.get().await?;
    let rows = client
        .timed_query_cached(
            "SELECT interaction_type, COUNT(*) AS total, AVG(reward) AS avg_reward
             FROM jm.recruiter_interactions
             GROUP BY interaction_type
             ORDER BY interaction_type",
            &[],
            "interactions.stats_by_kind",
        )
        .await?;
    rows.iter()
        .map(|row| {
            let kind: String = get(row, "interaction_type")?;
            Ok(KindStats {
                kind: parse_tag("interaction_type", &kind)?,
                count: get(row, "total")?,
                avg_reward: get::<Option<f64>>(row, "avg_reward")?.unwrap_or(0.0),
            })
        })
        .collect()
}

fn row_to_interaction(row: &Row) -> Result<RecruiterInteraction, StoreError> {
    let kind: String = get(row, "interaction_type")?;
    Ok(RecruiterInteraction {
        id: get(row, "id")?,
        recruiter_id: get(row, "recruiter_id")?,
        candidate_id: get(row, "candidate_id")?,
        job_id: get(row, "job_id")?,
        kind: parse_tag("interaction_type", &kind)?,
        semantic_score: get(row, "semantic_score")?,
        skill_overlap_score: get(row, "skill_overlap_score")?,
        experience_match_score: get(row, "experience_match_score")?,
        original_score: get(row, "original_score")?,
        search_position: get(row, "search_position")?,
        reward: get(row, "reward")?,
        session_id: get(row, "session_id")?,
        timestamp: get(row, "timestamp")?,
    })
}
