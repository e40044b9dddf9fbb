use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::interaction::{InteractionKind, ObservedScores, RecruiterInteraction, compute_reward};
use super::learning_weights::{LearningWeights, PerformanceMetrics};
use super::ridge::{Ridge, RidgeError, StandardScaler};
use crate::matching::weights::{DEFAULT_WEIGHTS, MatchWeights};
use crate::store::{InteractionStore, SharedStore, StoreError, WeightsStore};

/// Recruiter id stamped on interactions recorded through the feedback path.
pub const SYSTEM_RECRUITER: &str = "system";

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    /// Below this many interactions in total the defaults are always used.
    pub min_interactions: i64,
    pub min_training_samples: usize,
    /// Feedback path retrains on every Nth interaction past the minimum.
    pub retrain_every: i64,
    pub window_days: i64,
    pub max_interactions: usize,
    pub freshness_days: i64,
    pub min_confidence: f64,
    pub ridge_alpha: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_interactions: 50,
            min_training_samples: 10,
            retrain_every: 10,
            window_days: 30,
            max_interactions: 1000,
            freshness_days: 7,
            min_confidence: 0.3,
            ridge_alpha: 0.1,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

impl OptimizerConfig {
    /// Defaults overridden by `JM_LTR_MIN_INTERACTIONS` / `JM_LTR_RETRAIN_EVERY`.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            min_interactions: parse_env("JM_LTR_MIN_INTERACTIONS", base.min_interactions),
            retrain_every: parse_env("JM_LTR_RETRAIN_EVERY", base.retrain_every).max(1),
            ..base
        }
    }

    fn window(&self) -> Duration {
        Duration::days(self.window_days)
    }

    fn freshness(&self) -> Duration {
        Duration::days(self.freshness_days)
    }
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("{usable} usable samples, need {required}")]
    InsufficientSamples { usable: usize, required: usize },
    #[error(transparent)]
    Ridge(#[from] RidgeError),
}

/// Scaler and regressor for one retrain call. Built fresh every time so
/// concurrent retrains never share fitted state.
#[derive(Debug)]
pub struct TrainingContext {
    alpha: f64,
}

impl TrainingContext {
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }

    /// Fit on standardized features. Returns the model and its R² on the
    /// training sample.
    pub fn fit(&self, features: &[[f64; 3]], rewards: &[f64]) -> Result<(Ridge<3>, f64), RidgeError> {
        let scaler = StandardScaler::fit(features)?;
        let scaled = scaler.transform(features);
        let model = Ridge::fit(&scaled, rewards, self.alpha)?;
        let r2 = model.score(&scaled, rewards);
        Ok((model, r2))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    pub weights: MatchWeights,
    /// R² clamped to `>= 0`.
    pub confidence: f64,
    pub metrics: PerformanceMetrics,
    pub coefficients: [f64; 3],
}

/// Learn a weight triple from interaction history. Pure: no I/O, no shared
/// state.
pub fn retrain(
    history: &[RecruiterInteraction],
    config: &OptimizerConfig,
) -> Result<TrainingOutcome, TrainingError> {
    let (features, rewards): (Vec<[f64; 3]>, Vec<f64>) = history
        .iter()
        .filter_map(|i| i.features().map(|f| (f, i.effective_reward())))
        .filter(|(f, r)| f.iter().all(|x| x.is_finite()) && r.is_finite())
        .unzip();

    if features.len() < config.min_training_samples {
        return Err(TrainingError::InsufficientSamples {
            usable: features.len(),
            required: config.min_training_samples,
        });
    }

    let (model, r2) = TrainingContext::new(config.ridge_alpha).fit(&features, &rewards)?;
    // 全係数ゼロなら既定ブレンドにフォールバック
    let weights = MatchWeights::from_importances(model.coef).unwrap_or(DEFAULT_WEIGHTS);
    let confidence = if r2.is_finite() { r2.max(0.0) } else { 0.0 };
    let avg_reward = rewards.iter().sum::<f64>() / rewards.len() as f64;

    Ok(TrainingOutcome {
        weights,
        confidence,
        metrics: PerformanceMetrics {
            r2_score: confidence,
            training_samples: features.len(),
            avg_reward,
        },
        coefficients: model.coef,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStatus {
    Active,
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindBreakdown {
    pub count: i64,
    pub avg_reward: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub total_interactions: i64,
    pub recent_interactions: i64,
    pub current_weights: LearningWeights,
    pub interaction_breakdown: BTreeMap<String, KindBreakdown>,
    pub learning_status: LearningStatus,
}

/// Learning-to-rank weight optimizer over the shared store.
#[derive(Clone)]
pub struct RankOptimizer {
    store: SharedStore,
    config: OptimizerConfig,
}

impl RankOptimizer {
    pub fn new(store: SharedStore, config: OptimizerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Current weights for the scope. Never fails: store or training errors
    /// fall back to the last learned record for the scope, else the defaults.
    pub async fn get_optimal_weights(
        &self,
        job_category: Option<&str>,
        recruiter_id: Option<&str>,
    ) -> LearningWeights {
        self.get_optimal_weights_at(job_category, recruiter_id, Utc::now())
            .await
    }

    pub async fn get_optimal_weights_at(
        &self,
        job_category: Option<&str>,
        recruiter_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> LearningWeights {
        let count = match self.store.count_interactions().await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "failed to count interactions; using default weights");
                return LearningWeights::defaults(0);
            }
        };

        if count < self.config.min_interactions {
            debug!(
                interaction_count = count,
                min = self.config.min_interactions,
                "insufficient interactions; using default weights"
            );
            return LearningWeights::defaults(count);
        }

        let existing = match self.store.latest_weights(job_category, recruiter_id).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(error = %e, "failed to load learned weights");
                None
            }
        };

        if let Some(existing) = existing
            .as_ref()
            .filter(|w| w.is_fresh(now, self.config.freshness(), self.config.min_confidence))
        {
            return existing.clone();
        }

        match self.learn(job_category, recruiter_id, now).await {
            Ok(Some(learned)) => {
                if let Err(e) = self.store.insert_weights(&learned).await {
                    error!(error = %e, "failed to persist learned weights");
                }
                learned
            }
            Ok(None) => LearningWeights::defaults(count),
            Err(e) => {
                error!(error = %e, "failed to learn weights; keeping last known good");
                existing.unwrap_or_else(|| LearningWeights::defaults(count))
            }
        }
    }

    /// `Ok(None)` when there is not enough usable history.
    async fn learn(
        &self,
        job_category: Option<&str>,
        recruiter_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<LearningWeights>, LearnError> {
        let history = self
            .store
            .list_interactions_since(
                now - self.config.window(),
                recruiter_id,
                self.config.max_interactions,
            )
            .await?;

        let outcome = match retrain(&history, &self.config) {
            Ok(outcome) => outcome,
            Err(TrainingError::InsufficientSamples { usable, required }) => {
                info!(usable, required, "insufficient interaction data for training");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut learned = LearningWeights::from_weights(
            outcome.weights,
            outcome.confidence,
            history.len() as i64,
        );
        learned.job_category = job_category.map(str::to_string);
        learned.recruiter_id = recruiter_id.map(str::to_string);
        learned.performance_metrics = Some(outcome.metrics);
        learned.last_updated = now;

        info!(
            semantic = learned.semantic_weight,
            skill = learned.skill_weight,
            experience = learned.experience_weight,
            confidence = learned.confidence_score,
            samples = learned
                .performance_metrics
                .as_ref()
                .map(|m| m.training_samples)
                .unwrap_or(0),
            "learned weights"
        );
        Ok(Some(learned))
    }

    /// Append one interaction. The reward is derived from kind and position
    /// when the caller did not set one.
    pub async fn record_interaction(&self, mut interaction: RecruiterInteraction) -> bool {
        if interaction.reward.is_none() {
            interaction.reward = Some(compute_reward(interaction.kind, interaction.search_position));
        }

        match self.store.insert_interaction(&interaction).await {
            Ok(()) => {
                info!(
                    kind = interaction.kind.as_ref(),
                    candidate_id = %interaction.candidate_id,
                    job_id = %interaction.job_id,
                    reward = interaction.reward.unwrap_or_default(),
                    "recorded interaction"
                );
                true
            }
            Err(e) => {
                error!(error = %e, candidate_id = %interaction.candidate_id, "failed to record interaction");
                false
            }
        }
    }

    /// Record system feedback and retrain on every Nth interaction once past
    /// the minimum.
    pub async fn update_weights_with_feedback(
        &self,
        candidate_id: &str,
        job_id: &str,
        kind: InteractionKind,
        scores: ObservedScores,
    ) -> bool {
        let interaction =
            RecruiterInteraction::new(SYSTEM_RECRUITER, candidate_id, job_id, kind).with_scores(scores);
        if !self.record_interaction(interaction).await {
            return false;
        }

        match self.store.count_interactions().await {
            Ok(count) if count > self.config.min_interactions && count % self.config.retrain_every == 0 => {
                self.get_optimal_weights(None, None).await;
                info!(interaction_count = count, "triggered retraining from feedback");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to count interactions after feedback"),
        }
        true
    }

    pub async fn get_performance_metrics(&self) -> Result<PerformanceReport, StoreError> {
        let now = Utc::now();
        let total_interactions = self.store.count_interactions().await?;
        let recent_interactions = self
            .store
            .count_interactions_since(now - Duration::days(7))
            .await?;
        let current_weights = self
            .store
            .latest_weights(None, None)
            .await?
            .unwrap_or_else(|| LearningWeights::defaults(total_interactions));

        let interaction_breakdown = self
            .store
            .interaction_stats_by_kind()
            .await?
            .into_iter()
            .map(|s| {
                (
                    s.kind.as_ref().to_string(),
                    KindBreakdown {
                        count: s.count,
                        avg_reward: s.avg_reward,
                    },
                )
            })
            .collect();

        let learning_status = if total_interactions >= self.config.min_interactions {
            LearningStatus::Active
        } else {
            LearningStatus::InsufficientData
        };

        Ok(PerformanceReport {
            total_interactions,
            recent_interactions,
            current_weights,
            interaction_breakdown,
            learning_status,
        })
    }
}

#[derive(Debug, Error)]
enum LearnError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Training(#[from] TrainingError),
}
