use clap::Parser;
use dotenvy::dotenv;
use jm_common::db::{PgStore, PoolSettings, create_pool, run_migrations};
use jm_common::embedding::HashEmbedder;
use jm_common::logging::{init_tracing_subscriber, install_tracing_panic_hook};
use jm_common::ranking::OptimizerConfig;
use jm_common::tasks::{Services, TaskKind, TaskOrchestrator, WorkerPoolConfig};
use jm_common::vector_index::VectorIndex;
use serde_json::json;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const APP_NAME: &str = "jm-worker";
/// Owner recorded on tasks the scheduler submits.
const SYSTEM_OWNER: &str = "system";

#[derive(Parser, Debug)]
#[command(name = "jm-worker", about = "Runs matching, embedding and retraining tasks")]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    db_url: String,

    /// Worker id recorded on claimed tasks
    #[arg(long, default_value = "jm-worker")]
    worker_id: String,

    /// Tasks executed concurrently
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    #[arg(long, env = "JM_INDEX_PATH", default_value = "data/vector.index")]
    index_path: String,

    #[arg(
        long,
        env = "JM_INDEX_METADATA_PATH",
        default_value = "data/vector_metadata.json"
    )]
    metadata_path: String,

    /// Idle poll interval in milliseconds when the queue is empty
    #[arg(long, default_value_t = 1000)]
    idle_poll_interval_ms: u64,

    #[arg(long, default_value_t = 86_400)]
    retrain_interval_secs: u64,

    #[arg(long, default_value_t = 3_600)]
    cleanup_interval_secs: u64,

    /// Do not submit periodic retrain / cleanup tasks
    #[arg(long, default_value_t = false)]
    no_periodic: bool,

    #[arg(long, default_value_t = jm_common::embedding::DEFAULT_EMBEDDING_DIMENSION)]
    embedding_dimension: usize,
}

impl Cli {
    fn pool_size(&self) -> usize {
        // ワーカー枠 + 定期投入/ステータス用に少し余裕を持たせる
        self.concurrency.max(1) + 2
    }

    fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_id: self.worker_id.clone(),
            concurrency: self.concurrency.max(1),
            idle_poll_interval: Duration::from_millis(self.idle_poll_interval_ms.max(1)),
        }
    }
}

/// Submit `kind` every `period` until shutdown. The first tick fires after one
/// full period.
fn spawn_periodic(
    orchestrator: TaskOrchestrator,
    kind: TaskKind,
    period: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match orchestrator.submit(kind, SYSTEM_OWNER, &json!({})).await {
                        Ok(task_id) => info!(task_id = %task_id, kind = kind.as_str(), "periodic task submitted"),
                        Err(e) => error!(error = %e, kind = kind.as_str(), "failed to submit periodic task"),
                    }
                }
            }
        }
    })
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing_subscriber(APP_NAME);
    install_tracing_panic_hook(APP_NAME);

    let args = Cli::parse();
    let pool = create_pool(
        &args.db_url,
        &PoolSettings::new(args.pool_size()).with_application_name(APP_NAME),
    )?;
    let status = pool.status();
    info!(
        max_size = status.max_size,
        available = status.available,
        worker_id = %args.worker_id,
        concurrency = args.concurrency,
        "created postgres connection pool for jm worker",
    );

    run_migrations(&pool).await?;

    let store = Arc::new(PgStore::new(pool));
    let orchestrator = TaskOrchestrator::new(store.clone());
    orchestrator.recover().await?;

    let index = VectorIndex::open(&args.index_path, &args.metadata_path);
    let embedder = Arc::new(HashEmbedder::new(args.embedding_dimension));
    let services = Services::new(store, index, embedder)
        .with_optimizer_config(OptimizerConfig::from_env());
    let index = services.index.clone();

    let shutdown = CancellationToken::new();
    let mut schedulers = Vec::new();
    if !args.no_periodic {
        schedulers.push(spawn_periodic(
            orchestrator.clone(),
            TaskKind::PeriodicRetrain,
            Duration::from_secs(args.retrain_interval_secs.max(1)),
            shutdown.clone(),
        ));
        schedulers.push(spawn_periodic(
            orchestrator.clone(),
            TaskKind::Cleanup,
            Duration::from_secs(args.cleanup_interval_secs.max(1)),
            shutdown.clone(),
        ));
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("ctrl-c received; draining worker pool"),
                Err(e) => warn!(error = %e, "failed to listen for ctrl-c; shutting down"),
            }
            shutdown.cancel();
        });
    }

    let worker_pool = orchestrator.worker_pool(services, args.worker_pool_config());
    worker_pool.run(shutdown.clone()).await;

    for handle in schedulers {
        let _ = handle.await;
    }

    let index = index.read().await;
    if let Err(e) = index.save() {
        error!(error = %e, path = %index.index_path().display(), "failed to save vector index on shutdown");
    } else {
        info!(ntotal = index.ntotal(), "vector index saved");
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("jm-worker failed: {err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        use std::sync::Mutex;
        static ENV_GUARD: Mutex<()> = Mutex::new(());
        let _guard = ENV_GUARD.lock().unwrap();

        let prev: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                match value {
                    Some(v) => unsafe { std::env::set_var(key, v) },
                    None => unsafe { std::env::remove_var(key) },
                }
                (key.to_string(), previous)
            })
            .collect();

        f();

        for (key, value) in prev {
            match value {
                Some(v) => unsafe { std::env::set_var(&key, v) },
                None => unsafe { std::env::remove_var(&key) },
            }
        }
    }

    #[test]
    fn cli_defaults() {
        with_env(
            &[("JM_INDEX_PATH", None), ("JM_INDEX_METADATA_PATH", None)],
            || {
                let cli = Cli::parse_from(["jm-worker", "--db-url", "postgres://localhost/jm"]);
                assert_eq!(cli.worker_id, "jm-worker");
                assert_eq!(cli.concurrency, 4);
                assert_eq!(cli.index_path, "data/vector.index");
                assert_eq!(cli.metadata_path, "data/vector_metadata.json");
                assert_eq!(cli.retrain_interval_secs, 86_400);
                assert_eq!(cli.cleanup_interval_secs, 3_600);
                assert_eq!(cli.embedding_dimension, 384);
                assert!(!cli.no_periodic);
                assert_eq!(cli.pool_size(), 6);
            },
        );
    }

    #[test]
    fn index_paths_come_from_env() {
        with_env(
            &[
                ("JM_INDEX_PATH", Some("/tmp/jm/idx.bin")),
                ("JM_INDEX_METADATA_PATH", Some("/tmp/jm/meta.json")),
            ],
            || {
                let cli = Cli::parse_from(["jm-worker", "--db-url", "postgres://localhost/jm"]);
                assert_eq!(cli.index_path, "/tmp/jm/idx.bin");
                assert_eq!(cli.metadata_path, "/tmp/jm/meta.json");
            },
        );
    }

    #[test]
    fn worker_pool_config_clamps_concurrency() {
        let cli = Cli::parse_from([
            "jm-worker",
            "--db-url",
            "postgres://localhost/jm",
            "--concurrency",
            "0",
            "--idle-poll-interval-ms",
            "250",
            "--no-periodic",
        ]);
        let config = cli.worker_pool_config();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.idle_poll_interval, Duration::from_millis(250));
        assert!(cli.no_periodic);
    }
}
