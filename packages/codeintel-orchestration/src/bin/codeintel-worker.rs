//! codeintel-worker: consumes the upload queue and ingests LSIF artifacts.
//!
//! Runs, until Ctrl-C:
//! - a pool of workers claiming jobs from `worker.queue`
//! - one resetter per entry of `queues`, reclaiming stalled jobs
//!
//! Resetter counters are printed in prometheus text format on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use codeintel_orchestration::infrastructure::{FsBlobStore, GitBackend, StaticRegistry};
use codeintel_orchestration::{
    Config, DualStoreWriter, HandlerDeps, Resetter, ResetterMetrics, ResetterOptions,
    UploadHandler, WorkerOptions, WorkerPool,
};
use codeintel_storage::{
    BulkStore, JobStore, MetadataStore, SqliteBulkStore, SqliteJobStore, SqliteMetadataStore,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// LSIF upload ingestion worker.
#[derive(Parser, Debug)]
#[command(name = "codeintel-worker", version, about)]
struct Cli {
    /// Path to the worker YAML config.
    #[arg(long, env = "CODEINTEL_WORKER_CONFIG", default_value = "config/worker.yaml")]
    config: PathBuf,

    /// Override `worker.concurrency` from the config file.
    #[arg(long, env = "CODEINTEL_WORKER_CONCURRENCY")]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_yaml(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(concurrency) = cli.concurrency {
        config.worker.concurrency = concurrency;
        config.validate()?;
    }
    info!(path = %cli.config.display(), queue = %config.worker.queue, "loaded config");

    let paths = &config.paths;
    std::fs::create_dir_all(&paths.blob_dir)
        .with_context(|| format!("failed to create {}", paths.blob_dir.display()))?;

    // ── Stores ──────────────────────────────────────────────────────
    let queue: Arc<dyn JobStore> =
        Arc::new(SqliteJobStore::open(&paths.queue_db, &config.worker.queue)?);
    let bulk: Arc<dyn BulkStore> = Arc::new(SqliteBulkStore::open(&paths.bulk_db)?);
    let metadata: Arc<dyn MetadataStore> =
        Arc::new(SqliteMetadataStore::open(&paths.metadata_db)?);

    // ── Collaborators ───────────────────────────────────────────────
    let registry = StaticRegistry::from_config(&config.repositories);
    if registry.is_empty() {
        warn!("no repositories configured, every job will fail with repository not found");
    }

    let handler = Arc::new(UploadHandler::new(HandlerDeps {
        queue: Arc::clone(&queue),
        registry: Arc::new(registry),
        vcs: Arc::new(GitBackend::new(&paths.repos_dir)),
        blobs: Arc::new(FsBlobStore::new(&paths.blob_dir)),
        metadata: Arc::clone(&metadata),
        writer: DualStoreWriter::new(bulk, metadata, config.worker.replay_policy),
        requeue_delay: config.worker.requeue_delay(),
    }));
    let pool = WorkerPool::new(handler, WorkerOptions::from_settings(&config.worker));

    // ── Resetters ───────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let metrics = prometheus::Registry::new();
    let mut resetters = Vec::with_capacity(config.queues.len());

    for queue_config in &config.queues {
        let store: Arc<dyn JobStore> = if queue_config.table == config.worker.queue {
            Arc::clone(&queue)
        } else {
            Arc::new(SqliteJobStore::open(&paths.queue_db, &queue_config.table)?)
        };

        let mut resetter = Resetter::new(ResetterOptions::from_queue(queue_config), store);
        if queue_config.metrics {
            resetter = resetter.with_metrics(ResetterMetrics::new(&metrics, &queue_config.name)?);
        }

        let token = shutdown.clone();
        resetters.push(tokio::spawn(async move { resetter.run(token).await }));
    }
    info!(count = resetters.len(), "resetters started");

    // ── Shutdown ────────────────────────────────────────────────────
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown requested");
        signal.cancel();
    });

    let stats = pool.run(shutdown.clone()).await;
    for task in resetters {
        if let Err(e) = task.await {
            warn!(error = %e, "resetter task failed");
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metrics.gather(), &mut buffer)?;
    if !buffer.is_empty() {
        info!("final metrics:\n{}", String::from_utf8_lossy(&buffer));
    }

    info!(
        completed = stats.completed,
        requeued = stats.requeued,
        errored = stats.errored,
        abandoned = stats.abandoned,
        lost_ownership = stats.lost_ownership,
        "codeintel-worker stopped"
    );
    Ok(())
}
