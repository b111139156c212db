//! Commit/repository gate
//!
//! Decides whether a job can be processed now. A repository that is still
//! cloning, or that does not know the commit yet, is not an error: the job is
//! requeued without counting a failure.

use std::sync::Arc;
use tracing::debug;

use crate::collaborators::{Repository, RevisionStatus, VersionControl};
use crate::error::{Result, ResultExt};
use codeintel_storage::Job;

pub const REASON_CLONING: &str = "repository still cloning";
pub const REASON_COMMIT_NOT_FOUND: &str = "commit not found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// The commit is present; carries the resolved object id
    Proceed { resolved: String },
    Requeue { reason: &'static str },
}

pub struct CommitGate {
    vcs: Arc<dyn VersionControl>,
}

impl CommitGate {
    pub fn new(vcs: Arc<dyn VersionControl>) -> Self {
        Self { vcs }
    }

    /// Backend failures are returned as errors and fail the job
    pub async fn check(&self, job: &Job, repo: &Repository) -> Result<GateDecision> {
        let status = self
            .vcs
            .resolve_revision(repo, &job.commit)
            .await
            .wrap_err("version_control.resolve_revision")?;

        let decision = match status {
            RevisionStatus::Resolved(resolved) => GateDecision::Proceed { resolved },
            RevisionStatus::Cloning => GateDecision::Requeue {
                reason: REASON_CLONING,
            },
            RevisionStatus::NotFound => GateDecision::Requeue {
                reason: REASON_COMMIT_NOT_FOUND,
            },
        };
        debug!(
            "gate for upload {} ({}@{}): {:?}",
            job.id, repo.name, job.commit, decision
        );
        Ok(decision)
    }
}
