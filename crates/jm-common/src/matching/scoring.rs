use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::similarity::cosine_similarity;
use super::weights::MatchWeights;
use crate::{Candidate, JobPosting};

/// Where the semantic component came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticSource {
    VectorIndex,
    Cosine,
    /// Candidate or job had no embedding; semantic score is 0.
    MissingEmbedding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub semantic_weight: f64,
    pub skill_overlap_weight: f64,
    pub experience_weight: f64,
    pub matched_skills: Vec<String>,
    pub missing_skills: Vec<String>,
    pub semantic_source: SemanticSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchScore {
    pub total: f64,
    pub semantic: f64,
    pub skill_overlap: f64,
    pub experience: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkillOverlap {
    pub score: f64,
    pub matched: Vec<String>,
    pub missing: Vec<String>,
}

/// 必須スキルの充足率。必須スキルが無い案件は制約なしとして 1.0。
pub fn skill_overlap(candidate_skills: &[String], required_skills: &[String]) -> SkillOverlap {
    let required: BTreeSet<String> = required_skills
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if required.is_empty() {
        return SkillOverlap {
            score: 1.0,
            matched: Vec::new(),
            missing: Vec::new(),
        };
    }

    let possessed: BTreeSet<String> = candidate_skills
        .iter()
        .map(|s| s.trim().to_lowercase())
        .collect();

    let (matched, missing): (Vec<String>, Vec<String>) = required
        .into_iter()
        .partition(|skill| possessed.contains(skill));

    let total = matched.len() + missing.len();
    SkillOverlap {
        score: matched.len() as f64 / total as f64,
        matched,
        missing,
    }
}

/// 経験年数の充足率。要件 0 以下は 1.0、不足分は比率。
pub fn experience_match(candidate_years: i32, required_years: i32) -> f64 {
    if required_years <= 0 || candidate_years >= required_years {
        return 1.0;
    }
    (f64::from(candidate_years.max(0)) / f64::from(required_years)).clamp(0.0, 1.0)
}

fn finite_or_zero(value: f64, component: &'static str, candidate_id: &str) -> f64 {
    if value.is_finite() {
        value
    } else {
        tracing::warn!(
            candidate_id,
            component,
            "non-finite score component; degrading to 0.0"
        );
        0.0
    }
}

/// Score one candidate against one job.
///
/// `semantic_hit` is the vector index score for this candidate when the index
/// returned one. Otherwise the raw embeddings are compared with cosine
/// similarity. The two are never blended. The weights are used as given.
pub fn score_components(
    candidate: &Candidate,
    job: &JobPosting,
    weights: &MatchWeights,
    semantic_hit: Option<f64>,
) -> MatchScore {
    let (semantic, semantic_source) = match semantic_hit {
        Some(score) => (score, SemanticSource::VectorIndex),
        None if candidate.embedding.is_empty() || job.embedding.is_empty() => {
            (0.0, SemanticSource::MissingEmbedding)
        }
        None => (
            cosine_similarity(&candidate.embedding, &job.embedding),
            SemanticSource::Cosine,
        ),
    };
    let semantic = finite_or_zero(semantic, "semantic", &candidate.id);

    let overlap = skill_overlap(&candidate.skills, &job.required_skills);
    let skill = finite_or_zero(overlap.score, "skill_overlap", &candidate.id);
    let experience = finite_or_zero(
        experience_match(candidate.experience_years, job.min_experience_years),
        "experience",
        &candidate.id,
    );

    let total = weights.semantic * semantic + weights.skill * skill + weights.experience * experience;

    MatchScore {
        total: finite_or_zero(total, "total", &candidate.id),
        semantic,
        skill_overlap: skill,
        experience,
        breakdown: ScoreBreakdown {
            semantic_weight: weights.semantic,
            skill_overlap_weight: weights.skill,
            experience_weight: weights.experience,
            matched_skills: overlap.matched,
            missing_skills: overlap.missing,
            semantic_source,
        },
    }
}

pub fn score_match(candidate: &Candidate, job: &JobPosting, weights: &MatchWeights) -> MatchScore {
    score_components(candidate, job, weights, None)
}

/// A scored candidate as handed to callers. Derived data, never the source of
/// truth for anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub candidate_id: String,
    pub candidate_name: String,
    pub candidate_email: String,
    pub candidate_skills: Vec<String>,
    pub candidate_experience_years: i32,
    pub total_score: f64,
    pub semantic_score: f64,
    pub skill_overlap_score: f64,
    pub experience_match_score: f64,
    pub score_breakdown: ScoreBreakdown,
    #[serde(default)]
    pub blind_screening: bool,
}

impl MatchResult {
    pub fn from_score(candidate: &Candidate, score: MatchScore) -> Self {
        Self {
            candidate_id: candidate.id.clone(),
            candidate_name: candidate.name.clone(),
            candidate_email: candidate.email.clone(),
            candidate_skills: candidate.skills.clone(),
            candidate_experience_years: candidate.experience_years,
            total_score: score.total,
            semantic_score: score.semantic,
            skill_overlap_score: score.skill_overlap,
            experience_match_score: score.experience,
            score_breakdown: score.breakdown,
            blind_screening: false,
        }
    }
}

/// `score(candidate, job, weights) -> MatchResult`
pub fn score(candidate: &Candidate, job: &JobPosting, weights: &MatchWeights) -> MatchResult {
    MatchResult::from_score(candidate, score_match(candidate, job, weights))
}
