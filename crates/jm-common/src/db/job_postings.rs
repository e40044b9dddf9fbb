use tokio_postgres::Row;
use tracing::instrument;

use crate::db::PgPool;
use crate::db::util::{TimedClientExt, get, limit_param};
use crate::store::StoreError;
use crate::JobPosting;

const COLUMNS: &str = "id, title, company, description, required_skills, min_experience_years, \
                       location, embedding, created_by, created_at";

#[instrument(skip(pool, job), fields(job_id = %job.id))]
pub async fn upsert_job(pool: &PgPool, job: &JobPosting) -> Result<(), StoreError> {
    let client = pool.get().await?;
    client
        .timed_execute_cached(
            "INSERT INTO jm.job_postings
                (id, title, company, description, required_skills, min_experience_years,
                 location, embedding, created_by, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                company = EXCLUDED.company,
                description = EXCLUDED.description,
                required_skills = EXCLUDED.required_skills,
                min_experience_years = EXCLUDED.min_experience_years,
                location = EXCLUDED.location,
                embedding = EXCLUDED.embedding,
                created_by = EXCLUDED.created_by,
                created_at = EXCLUDED.created_at",
            &[
                &job.id,
                &job.title,
                &job.company,
                &job.description,
                &job.required_skills,
                &job.min_experience_years,
                &job.location,
                &job.embedding,
                &job.created_by,
                &job.created_at,
            ],
            "job_postings.upsert",
        )
        .await?;
    Ok(())
}

#[instrument(skip(pool))]
pub async fn fetch_job(pool: &PgPool, id: &str) -> Result<Option<JobPosting>, StoreError> {
    let client = pool.get().await?;
    let sql = format!("SELECT {COLUMNS} FROM jm.job_postings WHERE id = $1");
    let row = client
        .timed_query_opt_cached(&sql, &[&id], "job_postings.fetch")
        .await?;
    row.map(|r| row_to_job(&r)).transpose()
}

#[instrument(skip(pool))]
pub async fn list_jobs(pool: &PgPool, limit: usize) -> Result<Vec<JobPosting>, StoreError> {
    let client = pool.get().await?;
    let sql = format!("SELECT {COLUMNS} FROM jm.job_postings ORDER BY seq LIMIT $1");
    let rows = client
        .timed_query_cached(&sql, &[&limit_param(limit)], "job_postings.list")
        .await?;
    rows.iter().map(row_to_job).collect()
}

#[instrument(skip(pool, embedding), fields(dim = embedding.len()))]
pub async fn update_job_embedding(
    pool: &PgPool,
    id: &str,
    embedding: &[f32],
) -> Result<bool, StoreError> {
    let client = pool.get().await?;
    let embedding = embedding.to_vec();
    let updated = client
        .timed_execute_cached(
            "UPDATE jm.job_postings SET embedding = $2 WHERE id = $1",
            &[&id, &embedding],
            "job_postings.update_embedding",
        )
        .await?;
    Ok(updated > 0)
}

fn row_to_job(row: &Row) -> Result<JobPosting, StoreError> {
    Ok(JobPosting {
        id: get(row, "id")?,
        title: get(row, "title")?,
        company: get(row, "company")?,
        description: get(row, "description")?,
        required_skills: get(row, "required_skills")?,
        min_experience_years: get(row, "min_experience_years")?,
        location: get(row, "location")?,
        embedding: get(row, "embedding")?,
        created_by: get(row, "created_by")?,
        created_at: get(row, "created_at")?,
    })
}
