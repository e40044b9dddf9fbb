pub mod pipeline;
pub mod scoring;
pub mod similarity;
pub mod weights;

pub use pipeline::{RankOptions, SearchCacheEntry, rank_candidates, semantic_hits_from_index};
pub use scoring::{MatchResult, ScoreBreakdown, score, score_match};
pub use similarity::cosine_similarity;
pub use weights::{DEFAULT_WEIGHTS, MatchWeights};
