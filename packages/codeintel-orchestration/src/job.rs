use crate::error::{ErrorCategory, OrchestratorError, Result};
use chrono::{DateTime, Utc};
use codeintel_storage::Job;
use serde::{Deserialize, Serialize};

/// Phase of one handler run over a claimed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Claimed,
    Gate,
    Fetch,
    Correlate,
    Write,
    Finalize,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Claimed => "claimed",
            Phase::Gate => "gate",
            Phase::Fetch => "fetch",
            Phase::Correlate => "correlate",
            Phase::Write => "write",
            Phase::Finalize => "finalize",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "claimed" => Ok(Phase::Claimed),
            "gate" => Ok(Phase::Gate),
            "fetch" => Ok(Phase::Fetch),
            "correlate" => Ok(Phase::Correlate),
            "write" => Ok(Phase::Write),
            "finalize" => Ok(Phase::Finalize),
            _ => Err(OrchestratorError::parse(format!("Invalid phase: {}", s))),
        }
    }

    /// The phase that must follow this one, if any
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Claimed => Some(Phase::Gate),
            Phase::Gate => Some(Phase::Fetch),
            Phase::Fetch => Some(Phase::Correlate),
            Phase::Correlate => Some(Phase::Write),
            Phase::Write => Some(Phase::Finalize),
            Phase::Finalize => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a handler run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Data written and the job marked completed
    Completed,
    /// Job put back in the queue by the gate
    Requeued { reason: String },
    /// Job marked errored
    Errored {
        phase: Phase,
        category: ErrorCategory,
        reason: String,
    },
    /// Run stopped by cancellation; no state transition, the resetter reclaims the job
    Abandoned { phase: Phase },
    /// The queue rejected the final transition because the lease was revoked
    LostOwnership { phase: Phase },
}

impl HandleOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            HandleOutcome::Completed => "completed",
            HandleOutcome::Requeued { .. } => "requeued",
            HandleOutcome::Errored { .. } => "errored",
            HandleOutcome::Abandoned { .. } => "abandoned",
            HandleOutcome::LostOwnership { .. } => "lost_ownership",
        }
    }
}

/// Phase tracker for one run. Phases only move forward, one step at a time.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    job_id: i64,
    phase: Phase,
    started_at: DateTime<Utc>,
}

impl PhaseMachine {
    pub fn new(job: &Job) -> Self {
        Self {
            job_id: job.id,
            phase: Phase::Claimed,
            started_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Transition: current → `next`
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if self.phase.next() != Some(next) {
            return Err(OrchestratorError::InvalidPhaseTransition {
                from: self.phase.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.phase = next;
        Ok(())
    }
}
