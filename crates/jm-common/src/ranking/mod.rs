//! Learning-to-rank: recruiter interactions in, weight triples out.

pub mod interaction;
pub mod learning_weights;
pub mod optimizer;
pub mod ridge;

pub use interaction::{InteractionKind, ObservedScores, RecruiterInteraction, compute_reward};
pub use learning_weights::{LearningWeights, PerformanceMetrics};
pub use optimizer::{OptimizerConfig, RankOptimizer, TrainingOutcome, retrain};
