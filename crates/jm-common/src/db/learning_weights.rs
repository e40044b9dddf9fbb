use serde_json::Value;
use tokio_postgres::Row;
use tokio_postgres::types::Json;
use tracing::instrument;

use crate::db::PgPool;
use crate::db::util::{TimedClientExt, get, normalize_json};
use crate::ranking::learning_weights::LearningWeights;
use crate::store::StoreError;

#[instrument(skip(pool, weights), fields(weights_id = %weights.id))]
pub async fn insert_weights(pool: &PgPool, weights: &LearningWeights) -> Result<(), StoreError> {
    let client = pool.get().await?;
    let metrics = weights
        .performance_metrics
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;
    client
        .timed_execute_cached(
            "INSERT INTO jm.learning_weights
                (id, semantic_weight, skill_weight, experience_weight, confidence_score,
                 interaction_count, job_category, recruiter_id, performance_metrics, last_updated)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &[
                &weights.id,
                &weights.semantic_weight,
                &weights.skill_weight,
                &weights.experience_weight,
                &weights.confidence_score,
                &weights.interaction_count,
                &weights.job_category,
                &weights.recruiter_id,
                &normalize_json(&metrics),
                &weights.last_updated,
            ],
            "learning_weights.insert",
        )
        .await?;
    Ok(())
}

/// Ties on `last_updated` go to the row inserted last.
#[instrument(skip(pool))]
pub async fn latest_weights(
    pool: &PgPool,
    job_category: Option<&str>,
    recruiter_id: Option<&str>,
) -> Result<Option<LearningWeights>, StoreError> {
    let client = pool.get().await?;
    let row = client
        .timed_query_opt_cached(
            "SELECT id, semantic_weight, skill_weight, experience_weight, confidence_score,
                    interaction_count, job_category, recruiter_id, performance_metrics, last_updated
             FROM jm.learning_weights
             WHERE ($1::TEXT IS NULL OR job_category = $1)
               AND ($2::TEXT IS NULL OR recruiter_id = $2)
             ORDER BY last_updated DESC, seq DESC
             LIMIT 1",
            &[&job_category, &recruiter_id],
            "learning_weights.latest",
        )
        .await?;
    row.map(|r| row_to_weights(&r)).transpose()
}

fn row_to_weights(row: &Row) -> Result<LearningWeights, StoreError> {
    let metrics: Option<Json<Value>> = get(row, "performance_metrics")?;
    Ok(LearningWeights {
        id: get(row, "id")?,
        semantic_weight: get(row, "semantic_weight")?,
        skill_weight: get(row, "skill_weight")?,
        experience_weight: get(row, "experience_weight")?,
        confidence_score: get(row, "confidence_score")?,
        interaction_count: get(row, "interaction_count")?,
        job_category: get(row, "job_category")?,
        recruiter_id: get(row, "recruiter_id")?,
        performance_metrics: metrics
            .map(|Json(value)| serde_json::from_value(value))
            .transpose()?,
        last_updated: get(row, "last_updated")?,
    })
}
