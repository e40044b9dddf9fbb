use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::scoring::{MatchResult, score_components};
use super::weights::MatchWeights;
use crate::vector_index::VectorIndex;
use crate::{Candidate, JobPosting};

/// Search results stay attributable to recruiter actions for this long.
pub const SEARCH_CACHE_TTL_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankOptions {
    pub k: usize,
    pub blind_screening: bool,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            k: 10,
            blind_screening: false,
        }
    }
}

/// Semantic scores keyed by candidate id, taken from the vector index.
///
/// Only entries tagged `"type": "candidate"` count. When the same candidate
/// was indexed more than once the best hit wins.
pub fn semantic_hits_from_index(
    index: &VectorIndex,
    job_embedding: &[f32],
    k: usize,
) -> HashMap<String, f64> {
    let mut hits = HashMap::new();
    if job_embedding.is_empty() || k == 0 {
        return hits;
    }

    for hit in index.search(job_embedding, k, -1.0) {
        let is_candidate = hit.metadata.get("type").and_then(|v| v.as_str()) == Some("candidate");
        let Some(candidate_id) = hit.metadata.get("candidate_id").and_then(|v| v.as_str()) else {
            continue;
        };
        if is_candidate {
            hits.entry(candidate_id.to_string())
                .or_insert(f64::from(hit.score));
        }
    }
    hits
}

pub fn score_candidate(
    job: &JobPosting,
    candidate: &Candidate,
    weights: &MatchWeights,
    semantic_hits: &HashMap<String, f64>,
) -> MatchResult {
    let semantic_hit = semantic_hits.get(&candidate.id).copied();
    MatchResult::from_score(
        candidate,
        score_components(candidate, job, weights, semantic_hit),
    )
}

/// Descending total score, top `k`. The sort is stable so equal totals keep
/// retrieval order.
pub fn rank(mut matches: Vec<MatchResult>, k: usize) -> Vec<MatchResult> {
    matches.sort_by(|a, b| b.total_score.total_cmp(&a.total_score));
    matches.truncate(k);
    matches
}

/// Inline search path: score, rank and optionally redact.
pub fn rank_candidates(
    job: &JobPosting,
    candidates: &[Candidate],
    weights: &MatchWeights,
    semantic_hits: &HashMap<String, f64>,
    options: RankOptions,
) -> Vec<MatchResult> {
    let scored = candidates
        .iter()
        .map(|candidate| score_candidate(job, candidate, weights, semantic_hits))
        .collect();
    let mut ranked = rank(scored, options.k);
    if options.blind_screening {
        ranked.iter_mut().for_each(apply_blind_screening);
    }
    ranked
}

pub fn redact_name(name: &str) -> String {
    match name.split_whitespace().next().and_then(|part| part.chars().next()) {
        Some(initial) => format!("{initial}***"),
        None => "Anonymous".to_string(),
    }
}

pub fn redact_email(email: &str) -> String {
    let parts: Vec<&str> = email.split('@').collect();
    match parts.as_slice() {
        [local, domain] => {
            let prefix: String = local.chars().take(2).collect();
            format!("{prefix}***@{domain}")
        }
        _ => "***@***.com".to_string(),
    }
}

pub fn apply_blind_screening(result: &mut MatchResult) {
    result.candidate_name = redact_name(&result.candidate_name);
    result.candidate_email = redact_email(&result.candidate_email);
    result.blind_screening = true;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRanking {
    pub candidate_id: String,
    /// 1-based
    pub position: i32,
    pub total_score: f64,
    pub semantic_score: f64,
    pub skill_overlap_score: f64,
    pub experience_score: f64,
}

/// Snapshot of one search, keyed by (session, job). Interactions recorded
/// later look their rank position and component scores up here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCacheEntry {
    pub session_id: String,
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub weights_used: MatchWeights,
    pub candidate_rankings: Vec<CandidateRanking>,
}

impl SearchCacheEntry {
    pub fn from_matches(
        session_id: &str,
        job_id: &str,
        weights: MatchWeights,
        matches: &[MatchResult],
        timestamp: DateTime<Utc>,
    ) -> Self {
        let candidate_rankings = matches
            .iter()
            .enumerate()
            .map(|(i, m)| CandidateRanking {
                candidate_id: m.candidate_id.clone(),
                position: i32::try_from(i + 1).unwrap_or(i32::MAX),
                total_score: m.total_score,
                semantic_score: m.semantic_score,
                skill_overlap_score: m.skill_overlap_score,
                experience_score: m.experience_match_score,
            })
            .collect();

        Self {
            session_id: session_id.to_string(),
            job_id: job_id.to_string(),
            timestamp,
            weights_used: weights,
            candidate_rankings,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.timestamp >= Duration::minutes(SEARCH_CACHE_TTL_MINUTES)
    }

    pub fn ranking_for(&self, candidate_id: &str) -> Option<&CandidateRanking> {
        self.candidate_rankings
            .iter()
            .find(|r| r.candidate_id == candidate_id)
    }
}
