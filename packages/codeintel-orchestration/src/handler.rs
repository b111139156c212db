//! Upload handler: runs one claimed job through
//! gate -> fetch -> correlate -> write -> finalize.
//!
//! The handler owns every state transition of the job it holds. Each one
//! presents the lease token, and a `false` answer from the queue means the
//! lease was revoked (the resetter handed the job to someone else).

use chrono::{Duration, Utc};
use codeintel_storage::{Claim, Job, JobStore, MetadataStore};
use std::future::Future;
use std::io::Read;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{
    upload_blob_key, BlobStore, CommitChildren, Repository, RepositoryRegistry, VersionControl,
};
use crate::correlation::correlate;
use crate::error::{OrchestratorError, Result, ResultExt};
use crate::gate::{CommitGate, GateDecision};
use crate::job::{HandleOutcome, Phase, PhaseMachine};
use crate::writer::DualStoreWriter;

/// Everything the handler talks to
pub struct HandlerDeps {
    pub queue: Arc<dyn JobStore>,
    pub registry: Arc<dyn RepositoryRegistry>,
    pub vcs: Arc<dyn VersionControl>,
    pub blobs: Arc<dyn BlobStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub writer: DualStoreWriter,
    /// How long a gated job waits before it is eligible again
    pub requeue_delay: Duration,
}

pub struct UploadHandler {
    queue: Arc<dyn JobStore>,
    registry: Arc<dyn RepositoryRegistry>,
    vcs: Arc<dyn VersionControl>,
    gate: CommitGate,
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    writer: DualStoreWriter,
    requeue_delay: Duration,
}

/// Race `fut` against cancellation
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
        result = fut => result,
    }
}

impl UploadHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self {
            gate: CommitGate::new(Arc::clone(&deps.vcs)),
            queue: deps.queue,
            registry: deps.registry,
            vcs: deps.vcs,
            blobs: deps.blobs,
            metadata: deps.metadata,
            writer: deps.writer,
            requeue_delay: deps.requeue_delay,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobStore> {
        &self.queue
    }

    /// Process one claimed job.
    ///
    /// Only store failures while recording the final transition come back as
    /// `Err`; processing failures are recorded on the job and returned as
    /// `HandleOutcome::Errored`.
    pub async fn handle(&self, claim: &Claim, cancel: &CancellationToken) -> Result<HandleOutcome> {
        let mut phases = PhaseMachine::new(&claim.job);
        let result = self.run(claim, &mut phases, cancel).await;
        let phase = phases.phase();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => {
                info!("upload {} abandoned during {}", claim.id(), phase);
                HandleOutcome::Abandoned { phase }
            }
            Err(e) => {
                let category = e.category();
                let reason = format!("{}: {}", phase, e);
                warn!("upload {} failed ({}): {}", claim.id(), category, reason);

                let owned = self
                    .queue
                    .fail(claim.id(), claim.token, &reason)
                    .await
                    .wrap_err("queue.fail")?;
                if owned {
                    HandleOutcome::Errored {
                        phase,
                        category,
                        reason,
                    }
                } else {
                    HandleOutcome::LostOwnership { phase }
                }
            }
        };

        if let HandleOutcome::LostOwnership { phase } = &outcome {
            warn!("upload {} lost ownership during {}", claim.id(), phase);
        }
        debug!(
            "upload {} finished as {} after {}ms",
            claim.id(),
            outcome.name(),
            phases.elapsed_ms()
        );
        Ok(outcome)
    }

    async fn run(
        &self,
        claim: &Claim,
        phases: &mut PhaseMachine,
        cancel: &CancellationToken,
    ) -> Result<HandleOutcome> {
        let job = &claim.job;

        phases.advance(Phase::Gate)?;
        let repo = cancellable(cancel, self.lookup_repository(job)).await?;
        let resolved = match cancellable(cancel, self.gate.check(job, &repo)).await? {
            GateDecision::Proceed { resolved } => resolved,
            GateDecision::Requeue { reason } => {
                let after = Utc::now() + self.requeue_delay;
                let owned = self
                    .queue
                    .requeue(job.id, claim.token, after)
                    .await
                    .wrap_err("queue.requeue")?;
                if !owned {
                    return Ok(HandleOutcome::LostOwnership {
                        phase: phases.phase(),
                    });
                }
                info!("upload {} requeued until {}: {}", job.id, after, reason);
                return Ok(HandleOutcome::Requeued {
                    reason: reason.to_string(),
                });
            }
        };

        let on_default_branch =
            cancellable(cancel, self.vcs.is_on_default_branch(&repo, &resolved))
                .await
                .wrap_err("version_control.is_on_default_branch")?;

        phases.advance(Phase::Fetch)?;
        let reader = cancellable(cancel, self.open_artifact(job.id)).await?;

        phases.advance(Phase::Correlate)?;
        let lookup = CommitChildren::new(Arc::clone(&self.vcs), repo.clone(), resolved.clone());
        let bundle = correlate(reader, &job.root, &lookup, cancel).await?;
        debug!(
            "upload {}: correlated {} documents, {} result chunks",
            job.id,
            bundle.documents.len(),
            bundle.result_chunks.len()
        );

        let committed_at = cancellable(cancel, self.vcs.commit_timestamp(&repo, &resolved))
            .await
            .wrap_err("version_control.commit_timestamp")?
            .ok_or(OrchestratorError::CommitDoesNotExist)?;
        let metadata = Arc::clone(&self.metadata);
        let (repository_id, commit) = (job.repository_id, job.commit.clone());
        tokio::task::spawn_blocking(move || {
            metadata.update_committed_at(repository_id, &commit, committed_at)
        })
        .await?
        .wrap_err("metadata_store.update_committed_at")?;

        phases.advance(Phase::Write)?;
        let report = self.writer.write(job, Arc::new(bundle), cancel).await?;
        debug!("upload {}: {:?}", job.id, report);

        phases.advance(Phase::Finalize)?;
        let owned = self
            .queue
            .complete(job.id, claim.token)
            .await
            .wrap_err("queue.complete")?;
        if !owned {
            return Ok(HandleOutcome::LostOwnership {
                phase: phases.phase(),
            });
        }

        if let Err(e) = self.blobs.delete(&upload_blob_key(job.id)).await {
            warn!("upload {}: could not delete artifact: {}", job.id, e);
        }
        info!(
            "upload {} completed for repository {} at {} (default branch: {})",
            job.id, repo.name, job.commit, on_default_branch
        );
        Ok(HandleOutcome::Completed)
    }

    async fn lookup_repository(&self, job: &Job) -> Result<Repository> {
        self.registry
            .get_repository(job.repository_id)
            .await
            .wrap_err("registry.get_repository")?
            .ok_or(OrchestratorError::RepositoryNotFound(job.repository_id))
    }

    async fn open_artifact(&self, upload_id: i64) -> Result<Box<dyn Read + Send>> {
        let raw = self
            .blobs
            .get(&upload_blob_key(upload_id))
            .await
            .wrap_err("blob_store.get")?;
        let decoder = zstd::stream::read::Decoder::new(raw).wrap_err("zstd.decoder")?;
        Ok(Box::new(decoder))
    }
}
