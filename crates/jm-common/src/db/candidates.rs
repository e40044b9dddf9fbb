use tokio_postgres::Row;
use tracing::instrument;

use crate::db::PgPool;
use crate::db::util::{TimedClientExt, get, limit_param};
use crate::store::StoreError;
use crate::Candidate;

const COLUMNS: &str = "id, name, email, resume_text, skills, experience_years, education, \
                       embedding, created_by, created_at";

#[instrument(skip(pool, candidate), fields(candidate_id = %candidate.id))]
pub async fn upsert_candidate(pool: &PgPool, candidate: &Candidate) -> Result<(), StoreError> {
    let client = pool.get().await?;
    client
        .timed_execute_cached(
            "INSERT INTO jm.candidates
                (id, name, email, resume_text, skills, experience_years, education,
                 embedding, created_by, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                email = EXCLUDED.email,
                resume_text = EXCLUDED.resume_text,
                skills = EXCLUDED.skills,
                experience_years = EXCLUDED.experience_years,
                education = EXCLUDED.education,
                embedding = EXCLUDED.embedding,
                created_by = EXCLUDED.created_by,
                created_at = EXCLUDED.created_at",
            &[
                &candidate.id,
                &candidate.name,
                &candidate.email,
                &candidate.resume_text,
                &candidate.skills,
                &candidate.experience_years,
                &candidate.education,
                &candidate.embedding,
                &candidate.created_by,
                &candidate.created_at,
            ],
            "candidates.upsert",
        )
        .await?;
    Ok(())
}

#[instrument(skip(pool))]
pub async fn fetch_candidate(pool: &PgPool, id: &str) -> Result<Option<Candidate>, StoreError> {
    let client = pool.get().await?;
    let sql = format!("SELECT {COLUMNS} FROM jm.candidates WHERE id = $1");
    let row = client
        .timed_query_opt_cached(&sql, &[&id], "candidates.fetch")
        .await?;
    row.map(|r| row_to_candidate(&r)).transpose()
}

#[instrument(skip(pool))]
pub async fn list_candidates(pool: &PgPool, limit: usize) -> Result<Vec<Candidate>, StoreError> {
    let client = pool.get().await?;
    let sql = format!("SELECT {COLUMNS} FROM jm.candidates ORDER BY seq LIMIT $1");
    let rows = client
        .timed_query_cached(&sql, &[&limit_param(limit)], "candidates.list")
        .await?;
    rows.iter().map(row_to_candidate).collect()
}

#[instrument(skip(pool, embedding), fields(dim = embedding.len()))]
pub async fn update_candidate_embedding(
    pool: &PgPool,
    id: &str,
    embedding: &[f32],
) -> Result<bool, StoreError> {
    let client = pool.get().await?;
    let embedding = embedding.to_vec();
    let updated = client
        .timed_execute_cached(
            "UPDATE jm.candidates SET embedding = $2 WHERE id = $1",
            &[&id, &embedding],
            "candidates.update_embedding",
        )
        .await?;
    Ok(updated > 0)
}

fn row_to_candidate(row: &Row) -> Result<Candidate, StoreError> {
    Ok(Candidate {
        id: get(row, "id")?,
        name: get(row, "name")?,
        email: get(row, "email")?,
        resume_text: get(row, "resume_text")?,
        skills: get(row, "skills")?,
        experience_years: get(row, "experience_years")?,
        education: get(row, "education")?,
        embedding: get(row, "embedding")?,
        created_by: get(row, "created_by")?,
        created_at: get(row, "created_at")?,
    })
}
