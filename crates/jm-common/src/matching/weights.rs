use serde::{Deserialize, Serialize};

/// 学習データが不足しているときの既定ブレンド
pub const DEFAULT_WEIGHTS: MatchWeights = MatchWeights {
    semantic: 0.4,
    skill: 0.4,
    experience: 0.2,
};

/// Tolerance for "weights sum to one" on optimizer output.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchWeights {
    pub semantic: f64,
    pub skill: f64,
    pub experience: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        DEFAULT_WEIGHTS
    }
}

impl MatchWeights {
    pub fn sum(&self) -> f64 {
        self.semantic + self.skill + self.experience
    }

    pub fn is_normalized(&self) -> bool {
        (self.sum() - 1.0).abs() < WEIGHT_SUM_TOLERANCE
    }

    /// Turn raw importances (e.g. regression coefficients) into weights that
    /// sum to one. Signs are dropped. Returns `None` when every importance is
    /// zero or the values are not finite.
    pub fn from_importances(importances: [f64; 3]) -> Option<Self> {
        let [semantic, skill, experience] = importances.map(f64::abs);
        let total = semantic + skill + experience;
        if !(total.is_finite() && total > 0.0) {
            return None;
        }
        Some(Self {
            semantic: semantic / total,
            skill: skill / total,
            experience: experience / total,
        })
    }
}
