//! Worker pool
//!
//! `concurrency` workers each loop: claim a job, heartbeat it while the
//! handler runs, record the outcome. A heartbeat rejected by the queue means
//! the resetter revoked the lease; the job's token is cancelled so the
//! handler stops before writing anything further.

use codeintel_storage::{Claim, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerSettings;
use crate::error::{Result, ResultExt};
use crate::handler::UploadHandler;
use crate::job::HandleOutcome;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl WorkerOptions {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            concurrency: settings.concurrency,
            poll_interval: settings.poll_interval(),
            heartbeat_interval: settings.heartbeat_interval(),
        }
    }
}

/// Outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub requeued: u64,
    pub errored: u64,
    pub abandoned: u64,
    pub lost_ownership: u64,
    /// Claim or final-transition failures of the queue itself
    pub queue_errors: u64,
}

impl WorkerStats {
    pub fn record(&mut self, outcome: &HandleOutcome) {
        match outcome {
            HandleOutcome::Completed => self.completed += 1,
            HandleOutcome::Requeued { .. } => self.requeued += 1,
            HandleOutcome::Errored { .. } => self.errored += 1,
            HandleOutcome::Abandoned { .. } => self.abandoned += 1,
            HandleOutcome::LostOwnership { .. } => self.lost_ownership += 1,
        }
    }

    pub fn merge(&mut self, other: &WorkerStats) {
        self.completed += other.completed;
        self.requeued += other.requeued;
        self.errored += other.errored;
        self.abandoned += other.abandoned;
        self.lost_ownership += other.lost_ownership;
        self.queue_errors += other.queue_errors;
    }

    pub fn processed(&self) -> u64 {
        self.completed + self.requeued + self.errored + self.abandoned + self.lost_ownership
    }
}

struct Heartbeat {
    stop: CancellationToken,
    task: JoinHandle<bool>,
}

impl Heartbeat {
    fn spawn(
        queue: Arc<dyn JobStore>,
        id: i64,
        token: Uuid,
        interval: Duration,
        job_cancel: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => return false,
                    _ = ticker.tick() => match queue.heartbeat(id, token).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("upload {}: heartbeat rejected, lease revoked", id);
                            job_cancel.cancel();
                            return true;
                        }
                        Err(e) => warn!("upload {}: heartbeat failed: {}", id, e),
                    },
                }
            }
        });

        Self { stop, task }
    }

    /// Stop heartbeating; returns whether the lease was lost
    async fn finish(self) -> bool {
        self.stop.cancel();
        self.task.await.unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    handler: Arc<UploadHandler>,
    options: WorkerOptions,
}

impl WorkerPool {
    pub fn new(handler: Arc<UploadHandler>, options: WorkerOptions) -> Self {
        Self { handler, options }
    }

    /// Claim and process one job. `Ok(None)` when the queue had nothing eligible.
    pub async fn process_next(&self, cancel: &CancellationToken) -> Result<Option<HandleOutcome>> {
        let queue = Arc::clone(self.handler.queue());
        let claim = match queue.dequeue().await.wrap_err("queue.dequeue")? {
            Some(claim) => claim,
            None => return Ok(None),
        };
        self.process_claim(queue, claim, cancel).await.map(Some)
    }

    async fn process_claim(
        &self,
        queue: Arc<dyn JobStore>,
        claim: Claim,
        cancel: &CancellationToken,
    ) -> Result<HandleOutcome> {
        debug!(
            "claimed upload {} (repository {}, commit {})",
            claim.id(),
            claim.job.repository_id,
            claim.job.commit
        );

        let job_cancel = cancel.child_token();
        let heartbeat = Heartbeat::spawn(
            queue,
            claim.id(),
            claim.token,
            self.options.heartbeat_interval,
            job_cancel.clone(),
        );

        let result = self.handler.handle(&claim, &job_cancel).await;
        let lease_lost = heartbeat.finish().await;

        match result? {
            HandleOutcome::Abandoned { phase } if lease_lost => {
                Ok(HandleOutcome::LostOwnership { phase })
            }
            outcome => Ok(outcome),
        }
    }

    async fn worker_loop(&self, index: usize, shutdown: CancellationToken) -> WorkerStats {
        let mut stats = WorkerStats::default();
        debug!("worker {} started", index);

        while !shutdown.is_cancelled() {
            let idle = match self.process_next(&shutdown).await {
                Ok(Some(outcome)) => {
                    stats.record(&outcome);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    stats.queue_errors += 1;
                    warn!("worker {}: {}", index, e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
            }
        }

        debug!("worker {} stopped: {:?}", index, stats);
        stats
    }

    /// Run all workers until `shutdown` fires. In-flight jobs see the
    /// cancellation and are abandoned to the resetter.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerStats {
        info!("starting {} workers", self.options.concurrency);

        let handles: Vec<JoinHandle<WorkerStats>> = (0..self.options.concurrency)
            .map(|index| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(index, shutdown).await })
            })
            .collect();

        let mut total = WorkerStats::default();
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(stats) => total.merge(&stats),
                Err(e) => warn!("worker task failed: {}", e),
            }
        }

        info!(
            "workers stopped: {} processed ({} completed, {} requeued, {} errored)",
            total.processed(),
            total.completed,
            total.requeued,
            total.errored
        );
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::job::Phase;

    #[test]
    fn test_stats_record_and_merge() {
        let mut a = WorkerStats::default();
        a.record(&HandleOutcome::Completed);
        a.record(&HandleOutcome::Requeued {
            reason: "commit not found".to_string(),
        });

        let mut b = WorkerStats::default();
        b.record(&HandleOutcome::Errored {
            phase: Phase::Correlate,
            category: ErrorCategory::Permanent,
            reason: "correlate: bad".to_string(),
        });
        b.record(&HandleOutcome::Abandoned {
            phase: Phase::Write,
        });
        b.queue_errors = 1;

        a.merge(&b);
        assert_eq!(a.processed(), 4);
        assert_eq!(a.errored, 1);
        assert_eq!(a.queue_errors, 1);
    }

    #[test]
    fn test_options_from_settings() {
        let options = WorkerOptions::from_settings(&WorkerSettings::default());
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.heartbeat_interval, Duration::from_secs(5));
    }
}
