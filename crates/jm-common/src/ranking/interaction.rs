use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::matching::pipeline::SearchCacheEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InteractionKind {
    Click,
    Shortlist,
    Application,
    Interview,
    Hire,
    Reject,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 6] = [
        InteractionKind::Click,
        InteractionKind::Shortlist,
        InteractionKind::Application,
        InteractionKind::Interview,
        InteractionKind::Hire,
        InteractionKind::Reject,
    ];

    pub fn base_reward(self) -> f64 {
        match self {
            InteractionKind::Click => 0.1,
            InteractionKind::Shortlist => 0.3,
            InteractionKind::Application => 0.7,
            InteractionKind::Interview => 0.9,
            InteractionKind::Hire => 1.0,
            InteractionKind::Reject => -0.5,
        }
    }
}

/// 上位に表示された候補者ほど報酬を上乗せ（11 位以下は 0）
///
/// `search_position` is 1-based; the bonus is computed on the 0-based rank,
/// so the top result earns the full 0.2.
pub fn position_bonus(search_position: i32) -> f64 {
    let rank = search_position.saturating_sub(1).max(0);
    (f64::from(10 - rank) / 10.0 * 0.2).max(0.0)
}

/// Training label for one event. Not clamped.
pub fn compute_reward(kind: InteractionKind, search_position: Option<i32>) -> f64 {
    kind.base_reward() + search_position.map(position_bonus).unwrap_or(0.0)
}

/// Component scores observed when the recruiter acted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedScores {
    pub semantic_score: Option<f64>,
    pub skill_overlap_score: Option<f64>,
    pub experience_match_score: Option<f64>,
    pub total_score: Option<f64>,
}

/// One recruiter action. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecruiterInteraction {
    pub id: String,
    pub recruiter_id: String,
    pub candidate_id: String,
    pub job_id: String,
    #[serde(rename = "interaction_type")]
    pub kind: InteractionKind,
    #[serde(default)]
    pub semantic_score: Option<f64>,
    #[serde(default)]
    pub skill_overlap_score: Option<f64>,
    #[serde(default)]
    pub experience_match_score: Option<f64>,
    #[serde(default)]
    pub original_score: Option<f64>,
    /// 1-based rank in the search that produced the action.
    #[serde(default)]
    pub search_position: Option<i32>,
    #[serde(default)]
    pub reward: Option<f64>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RecruiterInteraction {
    pub fn new(
        recruiter_id: impl Into<String>,
        candidate_id: impl Into<String>,
        job_id: impl Into<String>,
        kind: InteractionKind,
    ) -> Self {
        Self {
            id: crate::run_id::generate(),
            recruiter_id: recruiter_id.into(),
            candidate_id: candidate_id.into(),
            job_id: job_id.into(),
            kind,
            semantic_score: None,
            skill_overlap_score: None,
            experience_match_score: None,
            original_score: None,
            search_position: None,
            reward: None,
            session_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_scores(mut self, scores: ObservedScores) -> Self {
        self.semantic_score = scores.semantic_score;
        self.skill_overlap_score = scores.skill_overlap_score;
        self.experience_match_score = scores.experience_match_score;
        self.original_score = scores.total_score;
        self
    }

    pub fn with_position(mut self, search_position: i32) -> Self {
        self.search_position = Some(search_position);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Fill position and scores from the cached search this action came
    /// from. Values already set are kept.
    pub fn attribute_from(&mut self, entry: &SearchCacheEntry) {
        let Some(ranking) = entry.ranking_for(&self.candidate_id) else {
            return;
        };
        self.search_position.get_or_insert(ranking.position);
        self.semantic_score.get_or_insert(ranking.semantic_score);
        self.skill_overlap_score
            .get_or_insert(ranking.skill_overlap_score);
        self.experience_match_score
            .get_or_insert(ranking.experience_score);
        self.original_score.get_or_insert(ranking.total_score);
        if self.session_id.is_none() {
            self.session_id = Some(entry.session_id.clone());
        }
    }

    pub fn effective_reward(&self) -> f64 {
        self.reward
            .unwrap_or_else(|| compute_reward(self.kind, self.search_position))
    }

    /// `[semantic, skill, experience]` when all three were recorded.
    pub fn features(&self) -> Option<[f64; 3]> {
        Some([
            self.semantic_score?,
            self.skill_overlap_score?,
            self.experience_match_score?,
        ])
    }
}
