use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::matching::weights::{DEFAULT_WEIGHTS, MatchWeights};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub r2_score: f64,
    pub training_samples: usize,
    pub avg_reward: f64,
}

/// One optimizer output. Records are appended, never updated; the newest one
/// in scope is "current".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningWeights {
    pub id: String,
    pub semantic_weight: f64,
    pub skill_weight: f64,
    pub experience_weight: f64,
    pub confidence_score: f64,
    pub interaction_count: i64,
    pub job_category: Option<String>,
    pub recruiter_id: Option<String>,
    pub performance_metrics: Option<PerformanceMetrics>,
    pub last_updated: DateTime<Utc>,
}

impl LearningWeights {
    /// The fixed default blend. Confidence is 0; `interaction_count` carries
    /// the count observed when the defaults were chosen.
    pub fn defaults(interaction_count: i64) -> Self {
        Self::from_weights(DEFAULT_WEIGHTS, 0.0, interaction_count)
    }

    pub fn from_weights(weights: MatchWeights, confidence_score: f64, interaction_count: i64) -> Self {
        Self {
            id: crate::run_id::generate(),
            semantic_weight: weights.semantic,
            skill_weight: weights.skill,
            experience_weight: weights.experience,
            confidence_score,
            interaction_count,
            job_category: None,
            recruiter_id: None,
            performance_metrics: None,
            last_updated: Utc::now(),
        }
    }

    pub fn weights(&self) -> MatchWeights {
        MatchWeights {
            semantic: self.semantic_weight,
            skill: self.skill_weight,
            experience: self.experience_weight,
        }
    }

    /// Reusable without retraining: younger than `max_age` and more confident
    /// than `min_confidence`.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration, min_confidence: f64) -> bool {
        now - self.last_updated < max_age && self.confidence_score > min_confidence
    }
}
