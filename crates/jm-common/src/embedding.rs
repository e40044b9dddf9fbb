use async_trait::async_trait;
use siphasher::sip::SipHasher13;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::{debug, warn};

use crate::matching::similarity::l2_normalize;
use crate::{Candidate, JobPosting};

pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;

/// 固定 seed（決定論的 hash のため）
/// ⚠️ この値を変更すると全 embedding が変わる → 再生成タスクを流すこと
const HASH_SEED_K0: u64 = 0x0123_4567_89ab_cdef;
const HASH_SEED_K1: u64 = 0xfedc_ba98_7654_3210;

/// Opaque text → vector function.
///
/// An empty vector means the embedding could not be produced. Implementations
/// never return an error to the scoring layer.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &'static str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Vec<f32>;
}

/// Feature Hashing による決定論的 embedder
///
/// - 学習不要、外部呼び出しなし
/// - SipHash13 + 固定 seed でプロセス間・バージョン間で安定
/// - sign hashing で衝突の偏りを打ち消す
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn hash_token(&self, token: &str) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(HASH_SEED_K0, HASH_SEED_K1);
        token.hash(&mut hasher);
        hasher.finish()
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut vector = vec![0.0f32; self.dimension];
        for token in &tokens {
            let idx = (self.hash_token(token) % self.dimension as u64) as usize;
            // Sign hashing: 偶数ハッシュ → +1, 奇数ハッシュ → -1
            let sign = if self.hash_token(&format!("{token}_sign")) % 2 == 0 {
                1.0
            } else {
                -1.0
            };
            vector[idx] += sign;
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSION)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Vec<f32> {
        self.embed_sync(text)
    }
}

/// Lowercased alphanumeric runs. `+`, `#` and `.` stay inside a token so
/// "c++", "c#" and "node.js" survive.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || matches!(c, '+' | '#' | '.')))
        .map(|t| t.trim_matches('.'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Retry schedule for embedding calls: exponential, clamped to
/// `[min_delay, max_delay]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbedRetryPolicy {
    pub attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for EmbedRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl EmbedRetryPolicy {
    pub const fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Wait before attempt `attempt + 1` (1-based `attempt`).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = Duration::from_secs(1u64 << attempt.min(16));
        exp.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }
}

/// Embed with retries on empty output. Returns `[]` once the attempts are used up.
pub async fn embed_with_retry(
    embedder: &dyn Embedder,
    text: &str,
    policy: EmbedRetryPolicy,
) -> Vec<f32> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        let vector = embedder.embed(text).await;
        if !vector.is_empty() {
            return vector;
        }
        if attempt < attempts {
            let delay = policy.delay_after(attempt);
            debug!(
                embedder = embedder.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "empty embedding; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    warn!(
        embedder = embedder.name(),
        attempts, "embedding failed after all attempts"
    );
    Vec::new()
}

pub fn candidate_embedding_text(candidate: &Candidate) -> String {
    candidate.resume_text.clone()
}

pub fn job_embedding_text(job: &JobPosting) -> String {
    format!(
        "{} {} {} {} {}",
        job.title,
        job.company,
        job.description,
        job.required_skills.join(" "),
        job.location
    )
}
