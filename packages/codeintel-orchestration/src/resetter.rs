//! Stall recovery
//!
//! A worker that crashes or hangs stops heartbeating its job. The resetter
//! periodically moves such jobs back to `queued` (voiding the old lease) and
//! gives up on jobs that have been reset too many times.

use chrono::{DateTime, Utc};
use codeintel_storage::{JobStore, ResetOutcome};
use prometheus::{register_int_counter_with_registry, IntCounter, Opts, Registry};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{Result, ResultExt};

#[derive(Debug, Clone)]
pub struct ResetterOptions {
    /// Queue name, used in logs and metric labels
    pub name: String,
    pub interval: Duration,
    /// A job whose heartbeat is older than this is stalled
    pub stalled_after: chrono::Duration,
    pub max_resets: u32,
}

impl ResetterOptions {
    pub fn from_queue(queue: &QueueConfig) -> Self {
        Self {
            name: queue.name.clone(),
            interval: Duration::from_secs(queue.interval_secs),
            stalled_after: chrono::Duration::seconds(queue.stalled_after_secs as i64),
            max_resets: queue.max_resets,
        }
    }
}

/// Counters of one resetter, labelled with the queue name
#[derive(Clone)]
pub struct ResetterMetrics {
    pub reset: IntCounter,
    pub errored: IntCounter,
    pub sweep_errors: IntCounter,
}

impl ResetterMetrics {
    pub fn new(registry: &Registry, queue: &str) -> Result<Self> {
        let opts = |name: &str, help: &str| Opts::new(name, help).const_label("queue", queue);
        Ok(Self {
            reset: register_int_counter_with_registry!(
                opts(
                    "codeintel_resetter_jobs_reset_total",
                    "Stalled jobs moved back to the queue"
                ),
                registry
            )?,
            errored: register_int_counter_with_registry!(
                opts(
                    "codeintel_resetter_jobs_errored_total",
                    "Stalled jobs errored after exceeding the reset limit"
                ),
                registry
            )?,
            sweep_errors: register_int_counter_with_registry!(
                opts(
                    "codeintel_resetter_errors_total",
                    "Resetter sweeps that failed"
                ),
                registry
            )?,
        })
    }
}

pub struct Resetter {
    options: ResetterOptions,
    store: Arc<dyn JobStore>,
    metrics: Option<ResetterMetrics>,
}

impl Resetter {
    pub fn new(options: ResetterOptions, store: Arc<dyn JobStore>) -> Self {
        Self {
            options,
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ResetterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// One sweep at `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<ResetOutcome> {
        let result = self
            .store
            .reset_stalled(now, self.options.stalled_after, self.options.max_resets)
            .await
            .wrap_err("queue.reset_stalled");

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.sweep_errors.inc();
                }
                return Err(e);
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.reset.inc_by(outcome.reset.len() as u64);
            metrics.errored.inc_by(outcome.errored.len() as u64);
        }
        if !outcome.reset.is_empty() {
            info!(
                "{}: reset {} stalled jobs: {:?}",
                self.options.name,
                outcome.reset.len(),
                outcome.reset
            );
        }
        if !outcome.errored.is_empty() {
            warn!(
                "{}: errored {} jobs over the reset limit: {:?}",
                self.options.name,
                outcome.errored.len(),
                outcome.errored
            );
        }
        Ok(outcome)
    }

    /// Sweep every `interval` until `shutdown` fires. Failed sweeps are logged
    /// and retried on the next tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(
            "{}: resetter started (every {:?}, stalled after {}s, max {} resets)",
            self.options.name,
            self.options.interval,
            self.options.stalled_after.num_seconds(),
            self.options.max_resets
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        warn!("{}: reset sweep failed: {}", self.options.name, e);
                    }
                }
            }
        }
        debug!("{}: resetter stopped", self.options.name);
    }
}
