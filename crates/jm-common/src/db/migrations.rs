use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio_postgres::Error as PgError;
use tracing::{info, instrument};

use crate::db::PgPool;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to run migration: {0}")]
    Postgres(#[from] PgError),
}

struct Migration {
    id: i32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        description: "candidates + job postings",
        sql: r#"
CREATE TABLE IF NOT EXISTS jm.candidates (
    seq BIGSERIAL,
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    resume_text TEXT NOT NULL DEFAULT '',
    skills TEXT[] NOT NULL DEFAULT '{}',
    experience_years INTEGER NOT NULL DEFAULT 0 CHECK (experience_years >= 0),
    education TEXT,
    embedding REAL[] NOT NULL DEFAULT '{}',
    created_by TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_candidates_seq ON jm.candidates(seq);

CREATE TABLE IF NOT EXISTS jm.job_postings (
    seq BIGSERIAL,
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    company TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    required_skills TEXT[] NOT NULL DEFAULT '{}',
    min_experience_years INTEGER NOT NULL DEFAULT 0,
    location TEXT NOT NULL DEFAULT '',
    embedding REAL[] NOT NULL DEFAULT '{}',
    created_by TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_job_postings_seq ON jm.job_postings(seq);
"#,
    },
    Migration {
        id: 2,
        description: "recruiter interactions + learning weights",
        sql: r#"
CREATE TABLE IF NOT EXISTS jm.recruiter_interactions (
    id TEXT PRIMARY KEY,
    recruiter_id TEXT NOT NULL,
    candidate_id TEXT NOT NULL,
    job_id TEXT NOT NULL,
    interaction_type TEXT NOT NULL,
    semantic_score DOUBLE PRECISION,
    skill_overlap_score DOUBLE PRECISION,
    experience_match_score DOUBLE PRECISION,
    original_score DOUBLE PRECISION,
    search_position INTEGER,
    reward DOUBLE PRECISION NOT NULL,
    session_id TEXT,
    "timestamp" TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_interactions_timestamp
    ON jm.recruiter_interactions("timestamp" DESC);
CREATE INDEX IF NOT EXISTS idx_interactions_recruiter
    ON jm.recruiter_interactions(recruiter_id, "timestamp" DESC);

CREATE TABLE IF NOT EXISTS jm.learning_weights (
    seq BIGSERIAL,
    id TEXT PRIMARY KEY,
    semantic_weight DOUBLE PRECISION NOT NULL,
    skill_weight DOUBLE PRECISION NOT NULL,
    experience_weight DOUBLE PRECISION NOT NULL,
    confidence_score DOUBLE PRECISION NOT NULL CHECK (confidence_score >= 0.0 AND confidence_score <= 1.0),
    interaction_count BIGINT NOT NULL,
    job_category TEXT,
    recruiter_id TEXT,
    performance_metrics JSONB,
    last_updated TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_learning_weights_latest
    ON jm.learning_weights(last_updated DESC, seq DESC);
"#,
    },
    Migration {
        id: 3,
        description: "task status + search cache",
        sql: r#"
CREATE TABLE IF NOT EXISTS jm.task_status (
    task_id TEXT PRIMARY KEY,
    task_type TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'started', 'progress', 'success', 'failure', 'revoked', 'retry')),
    progress SMALLINT NOT NULL DEFAULT 0 CHECK (progress >= 0 AND progress <= 100),
    result JSONB,
    error TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL,
    created_by TEXT NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    next_retry_at TIMESTAMPTZ,
    locked_by TEXT
);
CREATE INDEX IF NOT EXISTS idx_task_status_claimable
    ON jm.task_status(created_at, task_id)
    WHERE status IN ('pending', 'retry');
CREATE INDEX IF NOT EXISTS idx_task_status_owner
    ON jm.task_status(created_by, created_at DESC);

CREATE TABLE IF NOT EXISTS jm.search_cache (
    session_id TEXT NOT NULL,
    job_id TEXT NOT NULL,
    "timestamp" TIMESTAMPTZ NOT NULL,
    weights_used JSONB NOT NULL,
    candidate_rankings JSONB NOT NULL,
    PRIMARY KEY (session_id, job_id)
);
"#,
    },
];

#[instrument(skip(pool))]
pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrationError> {
    let mut client = pool.get().await?;
    client
        .batch_execute(
            "CREATE SCHEMA IF NOT EXISTS jm;
             CREATE TABLE IF NOT EXISTS jm.schema_migrations (
                id INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
             );",
        )
        .await?;

    for migration in MIGRATIONS {
        let already_applied: bool = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM jm.schema_migrations WHERE id = $1)",
                &[&migration.id],
            )
            .await?
            .get(0);

        if already_applied {
            continue;
        }

        let tx = client.transaction().await?;
        tx.batch_execute(migration.sql).await?;
        tx.execute(
            "INSERT INTO jm.schema_migrations (id, description) VALUES ($1, $2)",
            &[&migration.id, &migration.description],
        )
        .await?;
        tx.commit().await?;

        info!(
            id = migration.id,
            description = migration.description,
            "applied migration"
        );
    }

    Ok(())
}
