use jm_common::embedding::{HashEmbedder, candidate_embedding_text};
use jm_common::matching::semantic_hits_from_index;
use jm_common::store::{CandidateStore, MemoryStore};
use jm_common::tasks::handlers::resume::ResumeRequest;
use jm_common::tasks::{Services, TaskKind, TaskOrchestrator, TaskStatus, WorkerPoolConfig};
use jm_common::vector_index::VectorIndex;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn open(dir: &Path) -> VectorIndex {
    VectorIndex::open(dir.join("vector.index"), dir.join("vector_metadata.json"))
}

#[tokio::test]
async fn indexed_resumes_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());

    {
        let services = Services::new(store.clone(), open(dir.path()), Arc::new(HashEmbedder::new(48)));
        let orchestrator = TaskOrchestrator::new(store.clone());
        let pool = orchestrator.worker_pool(services, WorkerPoolConfig::default());
        for (id, text) in [("c-1", "Rust systems programmer"), ("c-2", "Marketing lead")] {
            let request = ResumeRequest {
                candidate_id: Some(id.into()),
                resume_text: text.into(),
                name: id.into(),
                ..Default::default()
            };
            orchestrator
                .submit(TaskKind::ResumeProcessing, "u-1", &request)
                .await
                .unwrap();
            assert_eq!(pool.run_once().await.unwrap(), Some(TaskStatus::Success));
        }
    }

    let mut reopened = open(dir.path());
    assert_eq!(reopened.ntotal(), 2);
    assert_eq!(reopened.dimension(), Some(48));
    assert_eq!(reopened.metadata(0).unwrap()["candidate_id"], "c-1");
    assert_eq!(reopened.metadata(1).unwrap()["type"], "candidate");

    let stored = store.get_candidate("c-1").await.unwrap().unwrap();
    let query = HashEmbedder::new(48).embed_sync(&candidate_embedding_text(&stored));
    let hits = semantic_hits_from_index(&reopened, &query, 2);
    assert!((hits["c-1"] - 1.0).abs() < 1e-5);
    assert!(hits["c-1"] > hits["c-2"]);

    // ids continue from the reloaded size
    let ids = reopened
        .add(&[vec![1.0; 48]], vec![json!({"type": "job", "job_id": "j-1"})])
        .unwrap();
    assert_eq!(ids, vec![2]);

    let err = reopened
        .add(&[vec![1.0; 12]], vec![json!({"type": "job"})])
        .unwrap_err();
    assert!(err.to_string().contains("dimension mismatch"));
}
