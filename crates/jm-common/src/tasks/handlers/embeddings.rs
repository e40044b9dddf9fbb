use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{Services, band_progress, into_result};
use crate::embedding::{candidate_embedding_text, job_embedding_text};
use crate::store::{CandidateStore, JobStore};
use crate::tasks::runtime::{TaskContext, TaskResult};

/// Upper bound on documents re-embedded by one regeneration task.
pub const MAX_REGENERATION_DOCUMENTS: usize = 10_000;

fn default_batch_name() -> String {
    "batch".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEmbeddingRequest {
    pub texts: Vec<String>,
    #[serde(default = "default_batch_name")]
    pub batch_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEmbeddingOutcome {
    pub batch_name: String,
    pub total_processed: usize,
    pub successful_embeddings: usize,
    pub failed_embeddings: usize,
    /// Same order as the request; a failed text has an empty vector.
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingCollection {
    Candidates,
    JobPostings,
}

impl EmbeddingCollection {
    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingCollection::Candidates => "candidates",
            EmbeddingCollection::JobPostings => "job_postings",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegenerationRequest {
    pub collection: EmbeddingCollection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegenerationOutcome {
    pub collection: String,
    pub total_documents: usize,
    pub updated_embeddings: usize,
    pub failed_embeddings: usize,
    /// Percentage, 0 to 100.
    pub success_rate: f64,
    /// Index entries rewritten with the new vectors. Always 0 for job
    /// postings, which are not indexed.
    #[serde(default)]
    pub reindexed_vectors: usize,
}

pub async fn generate_batch(
    services: &Services,
    ctx: &TaskContext,
    request: BatchEmbeddingRequest,
) -> TaskResult {
    let total = request.texts.len();
    ctx.progress(10, &format!("Processing {total} texts")).await?;

    let step = (total / 10).max(1);
    let mut embeddings = Vec::with_capacity(total);
    for (i, text) in request.texts.iter().enumerate() {
        embeddings.push(services.embed(text).await);
        if i % step == 0 || i % 10 == 0 {
            ctx.progress(
                band_progress(10, 90, i + 1, total),
                &format!("Generated {}/{total} embeddings", i + 1),
            )
            .await?;
        }
    }

    let successful_embeddings = embeddings.iter().filter(|e| !e.is_empty()).count();
    info!(
        task_id = ctx.task_id(),
        batch_name = %request.batch_name,
        total,
        successful_embeddings,
        "batch embedding finished"
    );
    into_result(&BatchEmbeddingOutcome {
        batch_name: request.batch_name,
        total_processed: total,
        successful_embeddings,
        failed_embeddings: total - successful_embeddings,
        embeddings,
    })
}

/// Re-embed every stored document of one collection. Candidate entries in
/// the vector index are rewritten in place so index hits never serve the old
/// vectors.
pub async fn regenerate_all(
    services: &Services,
    ctx: &TaskContext,
    request: RegenerationRequest,
) -> TaskResult {
    let collection = request.collection;
    // (id, display name, embedding text)
    let documents: Vec<(String, String, String)> = match collection {
        EmbeddingCollection::Candidates => services
            .store
            .list_candidates(MAX_REGENERATION_DOCUMENTS)
            .await?
            .iter()
            .map(|c| (c.id.clone(), c.name.clone(), candidate_embedding_text(c)))
            .collect(),
        EmbeddingCollection::JobPostings => services
            .store
            .list_jobs(MAX_REGENERATION_DOCUMENTS)
            .await?
            .iter()
            .map(|j| (j.id.clone(), j.title.clone(), job_embedding_text(j)))
            .collect(),
    };

    let total = documents.len();
    if total == 0 {
        return Ok(json!({
            "message": format!("No documents found in {}", collection.as_str()),
        }));
    }

    ctx.progress(
        10,
        &format!("Found {total} documents to process in {}", collection.as_str()),
    )
    .await?;

    let step = (total / 20).max(1);
    let mut updated = 0usize;
    let mut failed = 0usize;
    let mut reindexed = 0usize;
    for (i, (id, name, text)) in documents.iter().enumerate() {
        let embedding = services.embed(text).await;
        if embedding.is_empty() {
            failed += 1;
        } else {
            let stored = match collection {
                EmbeddingCollection::Candidates => {
                    services.store.update_candidate_embedding(id, &embedding).await
                }
                EmbeddingCollection::JobPostings => {
                    services.store.update_job_embedding(id, &embedding).await
                }
            };
            match stored {
                Ok(true) => {
                    updated += 1;
                    if collection == EmbeddingCollection::Candidates
                        && services.stage_candidate_vector(id, name, embedding).await
                    {
                        reindexed += 1;
                    }
                }
                Ok(false) => failed += 1,
                Err(e) => {
                    warn!(task_id = ctx.task_id(), id = %id, error = %e, "failed to store embedding");
                    failed += 1;
                }
            }
        }

        if i % step == 0 {
            ctx.progress(
                band_progress(10, 90, i + 1, total),
                &format!("Updated {updated} embeddings, {failed} failed"),
            )
            .await?;
        }
    }

    if reindexed > 0 {
        ctx.progress(95, "Saving vector index").await?;
        services.persist_index().await;
    }

    info!(
        task_id = ctx.task_id(),
        collection = collection.as_str(),
        updated,
        failed,
        reindexed,
        "embedding regeneration finished"
    );
    into_result(&RegenerationOutcome {
        collection: collection.as_str().to_string(),
        total_documents: total,
        updated_embeddings: updated,
        failed_embeddings: failed,
        success_rate: updated as f64 / total as f64 * 100.0,
        reindexed_vectors: reindexed,
    })
}
