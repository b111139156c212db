//! Job records held by a queue store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Persisted job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Errored,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Errored => "errored",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "errored" => Ok(JobState::Errored),
            _ => Err(StorageError::serialization(format!(
                "Invalid job state: {}",
                s
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Errored)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One ingestion request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub repository_id: i64,
    /// Commit hash the artifact was produced for
    pub commit: String,
    /// Path prefix of the indexed project within the repository
    pub root: String,
    pub indexer: String,
    pub state: JobState,
    pub failure_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    /// `None` means eligible immediately
    pub process_after: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub num_resets: u32,
    pub num_failures: u32,
}

/// Producer-side description of a job to enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub repository_id: i64,
    pub commit: String,
    pub root: String,
    pub indexer: String,
}

impl NewJob {
    pub fn new(
        repository_id: i64,
        commit: impl Into<String>,
        root: impl Into<String>,
        indexer: impl Into<String>,
    ) -> Self {
        Self {
            repository_id,
            commit: commit.into(),
            root: root.into(),
            indexer: indexer.into(),
        }
    }
}

/// A job claimed by `dequeue`, together with the lease token proving ownership.
///
/// Every mutation on a claimed job must present the token; once the job is
/// reset or finished the token is void and mutations become no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub job: Job,
    pub token: Uuid,
}

impl Claim {
    pub fn id(&self) -> i64 {
        self.job.id
    }
}

/// Failure message recorded on jobs evicted by stall recovery
pub const RESET_LIMIT_MESSAGE: &str = "exceeded reset limit";

/// Result of one stall-recovery sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetOutcome {
    /// Jobs moved back to `queued`
    pub reset: Vec<i64>,
    /// Jobs moved to `errored` because they exceeded the reset limit
    pub errored: Vec<i64>,
}

impl ResetOutcome {
    pub fn is_empty(&self) -> bool {
        self.reset.is_empty() && self.errored.is_empty()
    }
}

/// Per-repository job counts, consumed by status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub errored: u64,
}

impl JobStateCounts {
    pub fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Queued => self.queued += count,
            JobState::Processing => self.processing += count,
            JobState::Completed => self.completed += count,
            JobState::Errored => self.errored += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_roundtrip() {
        for state in &[
            JobState::Queued,
            JobState::Processing,
            JobState::Completed,
            JobState::Errored,
        ] {
            let parsed = JobState::from_str(state.as_str()).unwrap();
            assert_eq!(*state, parsed);
        }
    }

    #[test]
    fn test_job_state_invalid() {
        assert!(JobState::from_str("running").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Errored.is_terminal());
    }

    #[test]
    fn test_state_counts_add() {
        let mut counts = JobStateCounts::default();
        counts.add(JobState::Queued, 2);
        counts.add(JobState::Errored, 1);
        counts.add(JobState::Queued, 1);

        assert_eq!(counts.queued, 3);
        assert_eq!(counts.errored, 1);
        assert_eq!(counts.processing, 0);
    }
}
