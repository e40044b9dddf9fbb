use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

use super::{Services, band_progress, into_result};
use crate::matching::pipeline::{
    RankOptions, SearchCacheEntry, apply_blind_screening, rank, score_candidate,
    semantic_hits_from_index,
};
use crate::matching::scoring::MatchResult;
use crate::matching::weights::MatchWeights;
use crate::store::{CandidateStore, JobStore, SearchCacheStore};
use crate::tasks::runtime::{TaskContext, TaskError, TaskResult};

/// Upper bound on candidates loaded for one search.
pub const MAX_SEARCH_CANDIDATES: usize = 10_000;

fn default_k() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub job_id: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub blind_screening: bool,
    /// Generated when absent; keys the search cache entry.
    #[serde(default)]
    pub session_id: Option<String>,
}

impl SearchRequest {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            k: default_k(),
            blind_screening: false,
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub matches: Vec<MatchResult>,
    pub total_candidates_searched: usize,
    pub search_time_ms: u64,
    pub weights_used: MatchWeights,
    pub session_id: String,
}

pub async fn search_candidates(
    services: &Services,
    ctx: &TaskContext,
    request: SearchRequest,
    owner: &str,
) -> TaskResult {
    let outcome = run_search(services, ctx, &request, owner, true).await?;
    into_result(&outcome)
}

async fn milestone(ctx: &TaskContext, report: bool, progress: u8, message: &str) -> Result<(), TaskError> {
    if report {
        ctx.progress(progress, message).await
    } else if ctx.is_cancelled() {
        Err(TaskError::Cancelled)
    } else {
        Ok(())
    }
}

/// Score every stored candidate against one job. With `report` off the
/// milestones only act as cancellation checkpoints; bulk matching reports
/// its own per-job progress.
pub async fn run_search(
    services: &Services,
    ctx: &TaskContext,
    request: &SearchRequest,
    owner: &str,
    report: bool,
) -> Result<SearchOutcome, TaskError> {
    let started = Instant::now();
    let session_id = request
        .session_id
        .clone()
        .unwrap_or_else(crate::run_id::generate);

    milestone(ctx, report, 10, "Loading job posting").await?;
    let job = services
        .store
        .get_job(&request.job_id)
        .await?
        .ok_or_else(|| TaskError::permanent(format!("Job posting not found: {}", request.job_id)))?;

    milestone(ctx, report, 20, "Getting optimized weights").await?;
    let weights = services
        .optimizer
        .get_optimal_weights(Some(&job.title), Some(owner))
        .await
        .weights();

    milestone(ctx, report, 30, "Loading candidates").await?;
    let candidates = services.store.list_candidates(MAX_SEARCH_CANDIDATES).await?;
    if candidates.is_empty() {
        return Ok(SearchOutcome {
            matches: Vec::new(),
            total_candidates_searched: 0,
            search_time_ms: 0,
            weights_used: weights,
            session_id,
        });
    }

    let total = candidates.len();
    milestone(ctx, report, 40, &format!("Calculating scores for {total} candidates")).await?;
    let semantic_hits: HashMap<String, f64> = if job.embedding.is_empty() {
        HashMap::new()
    } else {
        let index = services.index.read().await;
        semantic_hits_from_index(&index, &job.embedding, total)
    };

    let step = (total / 4).max(1);
    let mut matches = Vec::with_capacity(total);
    for (i, candidate) in candidates.iter().enumerate() {
        matches.push(score_candidate(&job, candidate, &weights, &semantic_hits));
        if i % step == 0 {
            milestone(
                ctx,
                report,
                band_progress(40, 80, i + 1, total),
                &format!("Processed {}/{total} candidates", i + 1),
            )
            .await?;
        }
    }

    milestone(ctx, report, 90, "Ranking candidates").await?;
    let options = RankOptions {
        k: request.k,
        blind_screening: request.blind_screening,
    };
    let mut ranked = rank(matches, options.k);
    if options.blind_screening {
        ranked.iter_mut().for_each(apply_blind_screening);
    }

    milestone(ctx, report, 95, "Caching results").await?;
    let entry = SearchCacheEntry::from_matches(&session_id, &job.id, weights, &ranked, Utc::now());
    if let Err(e) = services.store.put_search_cache(&entry).await {
        warn!(job_id = %job.id, session_id = %session_id, error = %e, "failed to cache search results");
    }

    let search_time_ms = started.elapsed().as_millis() as u64;
    info!(
        task_id = ctx.task_id(),
        job_id = %job.id,
        candidates = total,
        returned = ranked.len(),
        semantic_hits = semantic_hits.len(),
        search_time_ms,
        "candidate search finished"
    );

    Ok(SearchOutcome {
        matches: ranked,
        total_candidates_searched: total,
        search_time_ms,
        weights_used: weights,
        session_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults() {
        let request: SearchRequest = serde_json::from_value(serde_json::json!({"job_id": "j"})).unwrap();
        assert_eq!(request.k, 10);
        assert!(!request.blind_screening);
        assert!(request.session_id.is_none());
    }
}
