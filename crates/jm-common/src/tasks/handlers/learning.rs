use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{Services, into_result};
use crate::ranking::interaction::RecruiterInteraction;
use crate::ranking::learning_weights::LearningWeights;
use crate::ranking::optimizer::{TrainingError, retrain};
use crate::store::{InteractionStore, SearchCacheStore, WeightsStore};
use crate::tasks::runtime::{TaskContext, TaskError, TaskResult};

/// Periodic retraining waits for this many interactions since the last run.
pub const PERIODIC_MIN_NEW_INTERACTIONS: i64 = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrainRequest {
    #[serde(default)]
    pub job_category: Option<String>,
    #[serde(default)]
    pub recruiter_id: Option<String>,
    /// Skip the total-interaction minimum.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub r2_score: f64,
    pub training_samples: usize,
    pub avg_reward: f64,
    pub positive_interactions: usize,
    pub negative_interactions: usize,
    pub positive_ratio: f64,
    pub avg_reward_by_position: BTreeMap<i32, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainOutcome {
    pub status: String,
    pub interaction_count: usize,
    pub training_samples: usize,
    pub model_performance: ModelPerformance,
    pub weights: LearningWeights,
    pub retrained_at: DateTime<Utc>,
}

fn skipped(reason: String, count_key: &str, count: i64) -> Value {
    json!({
        "status": "skipped",
        "reason": reason,
        count_key: count,
    })
}

/// Fill missing component scores from the search the interaction came from.
/// The cache is read as of the interaction time.
async fn attribute_history(services: &Services, history: &mut [RecruiterInteraction]) {
    for interaction in history.iter_mut().filter(|i| i.features().is_none()) {
        let Some(session_id) = interaction.session_id.clone() else {
            continue;
        };
        match services
            .store
            .get_search_cache(&session_id, &interaction.job_id, interaction.timestamp)
            .await
        {
            Ok(Some(entry)) => interaction.attribute_from(&entry),
            Ok(None) => {}
            Err(e) => debug!(error = %e, session_id = %session_id, "search cache lookup failed"),
        }
    }
}

fn evaluate(history: &[RecruiterInteraction], r2_score: f64) -> ModelPerformance {
    let samples: Vec<&RecruiterInteraction> =
        history.iter().filter(|i| i.features().is_some()).collect();
    let total = samples.len();
    let rewards: Vec<f64> = samples.iter().map(|i| i.effective_reward()).collect();
    let positive = rewards.iter().filter(|r| **r > 0.0).count();
    let negative = rewards.iter().filter(|r| **r < 0.0).count();

    let mut by_position: BTreeMap<i32, (f64, usize)> = BTreeMap::new();
    for (interaction, reward) in samples.iter().zip(&rewards) {
        if let Some(position) = interaction.search_position {
            let slot = by_position.entry(position).or_insert((0.0, 0));
            slot.0 += reward;
            slot.1 += 1;
        }
    }

    ModelPerformance {
        r2_score,
        training_samples: total,
        avg_reward: if total == 0 { 0.0 } else { rewards.iter().sum::<f64>() / total as f64 },
        positive_interactions: positive,
        negative_interactions: negative,
        positive_ratio: if total == 0 { 0.0 } else { positive as f64 / total as f64 },
        avg_reward_by_position: by_position
            .into_iter()
            .map(|(position, (sum, n))| (position, sum / n as f64))
            .collect(),
    }
}

pub async fn retrain_model(
    services: &Services,
    ctx: &TaskContext,
    request: RetrainRequest,
) -> TaskResult {
    let config = services.optimizer.config().clone();
    let now = Utc::now();

    ctx.progress(10, "Checking retraining requirements").await?;
    if !request.force {
        let total = services.store.count_interactions().await?;
        if total < config.min_interactions {
            return Ok(skipped(
                format!("Insufficient interactions ({total} < {})", config.min_interactions),
                "interaction_count",
                total,
            ));
        }
    }

    ctx.progress(30, "Loading interaction data").await?;
    let mut history = services
        .store
        .list_interactions_since(
            now - Duration::days(config.window_days),
            request.recruiter_id.as_deref(),
            config.max_interactions,
        )
        .await?;
    if history.len() < config.min_training_samples {
        return Ok(skipped(
            format!(
                "Insufficient recent interactions ({} < {})",
                history.len(),
                config.min_training_samples
            ),
            "interaction_count",
            history.len() as i64,
        ));
    }

    ctx.progress(50, "Preparing training data").await?;
    attribute_history(services, &mut history).await;

    ctx.progress(70, "Training model").await?;
    let outcome = match retrain(&history, &config) {
        Ok(outcome) => outcome,
        Err(TrainingError::InsufficientSamples { usable, required }) => {
            return Ok(skipped(
                format!("Insufficient training samples ({usable} < {required})"),
                "interaction_count",
                history.len() as i64,
            ));
        }
        Err(e) => return Err(TaskError::permanent(format!("training failed: {e}"))),
    };

    ctx.progress(85, "Validating model performance").await?;
    let model_performance = evaluate(&history, outcome.metrics.r2_score);

    ctx.progress(95, "Updating optimal weights").await?;
    let mut weights =
        LearningWeights::from_weights(outcome.weights, outcome.confidence, history.len() as i64);
    weights.job_category = request.job_category.clone();
    weights.recruiter_id = request.recruiter_id.clone();
    weights.performance_metrics = Some(outcome.metrics.clone());
    weights.last_updated = now;
    services.store.insert_weights(&weights).await?;

    info!(
        task_id = ctx.task_id(),
        samples = outcome.metrics.training_samples,
        r2 = outcome.metrics.r2_score,
        semantic = weights.semantic_weight,
        skill = weights.skill_weight,
        experience = weights.experience_weight,
        "model retrained"
    );

    into_result(&RetrainOutcome {
        status: "completed".into(),
        interaction_count: history.len(),
        training_samples: outcome.metrics.training_samples,
        model_performance,
        weights,
        retrained_at: now,
    })
}

/// Time-triggered retrain. Runs only once enough interactions arrived since
/// the later of 24 hours ago and the last stored weights.
pub async fn periodic_retrain(services: &Services, ctx: &TaskContext) -> TaskResult {
    let now = Utc::now();
    let mut cutoff = now - Duration::hours(24);
    if let Some(last) = services.store.latest_weights(None, None).await? {
        cutoff = cutoff.max(last.last_updated);
    }

    let new_interactions = services.store.count_interactions_since(cutoff).await?;
    if new_interactions < PERIODIC_MIN_NEW_INTERACTIONS {
        return Ok(skipped(
            format!(
                "Insufficient new interactions ({new_interactions} < {PERIODIC_MIN_NEW_INTERACTIONS})"
            ),
            "new_interactions",
            new_interactions,
        ));
    }

    let retrain_result = retrain_model(
        services,
        ctx,
        RetrainRequest {
            force: true,
            ..Default::default()
        },
    )
    .await?;

    Ok(json!({
        "status": "completed",
        "new_interactions": new_interactions,
        "retrain_result": retrain_result,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::interaction::{InteractionKind, ObservedScores};

    #[test]
    fn evaluation_groups_rewards_by_position() {
        let scores = ObservedScores {
            semantic_score: Some(0.5),
            skill_overlap_score: Some(0.5),
            experience_match_score: Some(0.5),
            total_score: Some(0.5),
        };
        let history = vec![
            RecruiterInteraction::new("r", "c1", "j", InteractionKind::Hire)
                .with_scores(scores)
                .with_position(1),
            RecruiterInteraction::new("r", "c2", "j", InteractionKind::Reject)
                .with_scores(scores)
                .with_position(2),
            RecruiterInteraction::new("r", "c3", "j", InteractionKind::Click),
        ];

        let perf = evaluate(&history, 0.4);

        assert_eq!(perf.training_samples, 2);
        assert_eq!(perf.positive_interactions, 1);
        assert_eq!(perf.negative_interactions, 1);
        assert!((perf.positive_ratio - 0.5).abs() < 1e-12);
        assert_eq!(perf.avg_reward_by_position.len(), 2);
        assert!((perf.avg_reward_by_position[&1] - 1.2).abs() < 1e-12);
    }
}
