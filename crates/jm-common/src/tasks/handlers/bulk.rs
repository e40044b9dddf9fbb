use serde::{Deserialize, Serialize};
use tracing::warn;

use super::search::{SearchRequest, run_search};
use super::{Services, band_progress, into_result};
use crate::matching::scoring::MatchResult;
use crate::tasks::runtime::{TaskContext, TaskError, TaskResult};

fn default_k() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkMatchingRequest {
    pub job_ids: Vec<String>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub blind_screening: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMatchStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMatchReport {
    pub job_id: String,
    pub status: JobMatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<MatchResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkMatchingOutcome {
    pub total_jobs: usize,
    pub successful_jobs: usize,
    pub failed_jobs: usize,
    pub results: Vec<JobMatchReport>,
}

/// One search per job. A failing job is reported and the batch goes on;
/// only cancellation stops it.
pub async fn bulk_matching(
    services: &Services,
    ctx: &TaskContext,
    request: BulkMatchingRequest,
    owner: &str,
) -> TaskResult {
    let total = request.job_ids.len();
    let mut results = Vec::with_capacity(total);

    for (i, job_id) in request.job_ids.iter().enumerate() {
        let search = SearchRequest {
            job_id: job_id.clone(),
            k: request.k,
            blind_screening: request.blind_screening,
            session_id: request.session_id.clone(),
        };

        let report = match run_search(services, ctx, &search, owner, false).await {
            Ok(outcome) => JobMatchReport {
                job_id: job_id.clone(),
                status: JobMatchStatus::Success,
                matches: Some(outcome.matches),
                error: None,
            },
            Err(TaskError::Cancelled) => return Err(TaskError::Cancelled),
            Err(e) => {
                warn!(task_id = ctx.task_id(), job_id = %job_id, error = %e, "bulk matching failed for job");
                JobMatchReport {
                    job_id: job_id.clone(),
                    status: JobMatchStatus::Failure,
                    matches: None,
                    error: Some(e.to_string()),
                }
            }
        };
        results.push(report);

        ctx.progress(
            band_progress(5, 95, i + 1, total),
            &format!("Completed matching for job {}/{total}", i + 1),
        )
        .await?;
    }

    let successful_jobs = results
        .iter()
        .filter(|r| r.status == JobMatchStatus::Success)
        .count();
    into_result(&BulkMatchingOutcome {
        total_jobs: total,
        successful_jobs,
        failed_jobs: total - successful_jobs,
        results,
    })
}
