/*
 * Codeintel Orchestration - LSIF upload ingestion pipeline
 *
 * Turns uploaded code-intelligence artifacts into query-ready data.
 *
 * Architecture:
 * - Job queue with lease-based ownership (codeintel-storage)
 * - Resetter for stalled jobs
 * - Commit/repository gate
 * - Bundle correlator (read, canonicalize, prune, group)
 * - Dual-store writer (bulk store + metadata store)
 * - Worker pool with per-job heartbeats
 */

pub mod collaborators;
pub mod config;
pub mod correlation;
pub mod error;
pub mod gate;
pub mod handler;
pub mod infrastructure;
pub mod job;
pub mod resetter;
pub mod worker;
pub mod writer;

pub use collaborators::{
    upload_blob_key, BlobStore, ChildrenLookup, CommitChildren, Repository, RepositoryRegistry,
    RevisionStatus, VersionControl,
};
pub use config::{Config, ConfigError, QueueConfig, RepositoryConfig, WorkerSettings};
pub use correlation::correlate;
pub use error::{ErrorCategory, OrchestratorError, Result, ResultExt};
pub use gate::{CommitGate, GateDecision};
pub use handler::{HandlerDeps, UploadHandler};
pub use job::{HandleOutcome, Phase, PhaseMachine};
pub use resetter::{Resetter, ResetterMetrics, ResetterOptions};
pub use worker::{WorkerOptions, WorkerPool, WorkerStats};
pub use writer::{BulkWriteStatus, DualStoreWriter, ReplayPolicy, WriteReport};
