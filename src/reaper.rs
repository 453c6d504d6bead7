//! Recovery of tasks whose worker went away.
//!
//! A worker that crashes between claiming a task and recording its outcome
//! leaves the record in `Processing`. The bus will eventually redeliver the
//! work event, but the redelivered copy is dropped as a duplicate because
//! the task is no longer `Pending`. The reaper closes that gap: claims older
//! than the grace period are handed back to `Pending` and the work event is
//! republished, or the task is failed once it has used up its attempts.
//!
//! `Pending` tasks that have sat untouched for longer than the grace period
//! get their work event republished as well, which covers a submitter that
//! stored a task but never managed to publish it. Republishing stamps the
//! task first, so a backlog is announced at most once per grace period.
//!
//! The grace period must exceed the workers' compute timeout. A claim is only
//! refreshed when the worker records its outcome, so a shorter grace period
//! would reclaim healthy work that is still computing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, TaskEvent};
use crate::domain::{Payload, TaskStatus};
use crate::error::TaskError;
use crate::store::{ReclaimOutcome, TaskStore};

/// Default stale-claim threshold: the default compute timeout plus a
/// minute for the outcome to be written.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(180);

/// Reaper settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Topic reclaimed work is republished to.
    pub work_topic: String,
    /// How long a claim may go without an update before it is stale. Keep
    /// it above the worker's compute timeout.
    pub grace_period: Duration,
    /// Claims allowed per task before it is failed as abandoned.
    pub max_attempts: u32,
    /// Pause between sweeps in [`Reaper::run`].
    pub scan_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            work_topic: "taskbridge.work".to_string(),
            grace_period: DEFAULT_GRACE_PERIOD,
            max_attempts: 5,
            scan_interval: Duration::from_secs(15),
        }
    }
}

/// Counts from one [`Reaper::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Stale `Processing` tasks put back to `Pending`.
    pub reclaimed: usize,
    /// Tasks failed for running out of attempts.
    pub abandoned: usize,
    /// Idle `Pending` tasks whose work event was published again.
    pub republished: usize,
    /// Work events that could not be published. Retried once the grace
    /// period has passed again.
    pub publish_failures: usize,
    /// Expired records removed from the backend.
    pub expired: usize,
}

/// Periodically recovers stale claims.
pub struct Reaper {
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
    config: ReaperConfig,
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reaper {
    /// Creates a reaper over the given store and bus.
    pub fn new(store: Arc<dyn TaskStore>, bus: Arc<dyn MessageBus>, config: ReaperConfig) -> Self {
        Self { store, bus, config }
    }

    /// Returns the reaper's configuration.
    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Runs one recovery pass.
    ///
    /// Failures on individual tasks are logged and skipped; only a failure
    /// to list tasks aborts the sweep.
    pub async fn sweep(&self) -> Result<ReapReport, TaskError> {
        let grace = chrono::Duration::from_std(self.config.grace_period)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let stale_before = Utc::now()
            .checked_sub_signed(grace)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let mut report = ReapReport::default();

        for record in self.store.list(Some(TaskStatus::Processing)).await? {
            if record.updated_at >= stale_before {
                continue;
            }
            let correlation_id = record.correlation_id.as_str();
            match self
                .store
                .reclaim(correlation_id, stale_before, self.config.max_attempts)
                .await
            {
                Ok(ReclaimOutcome::Reclaimed(reclaimed)) => {
                    report.reclaimed += 1;
                    self.republish(&reclaimed.correlation_id, reclaimed.payload, &mut report)
                        .await;
                },
                Ok(ReclaimOutcome::Abandoned(_)) => report.abandoned += 1,
                Ok(ReclaimOutcome::Skipped) => {},
                Err(e) => {
                    tracing::warn!(%correlation_id, error = %e, "failed to reclaim task");
                },
            }
        }

        for record in self.store.list(Some(TaskStatus::Pending)).await? {
            if record.updated_at >= stale_before {
                continue;
            }
            let correlation_id = record.correlation_id.as_str();
            match self.store.requeue(correlation_id, stale_before).await {
                Ok(Some(stamped)) => {
                    if self
                        .republish(&stamped.correlation_id, stamped.payload, &mut report)
                        .await
                    {
                        report.republished += 1;
                    }
                },
                Ok(None) => {},
                Err(e) => {
                    tracing::warn!(%correlation_id, error = %e, "failed to requeue idle task");
                },
            }
        }

        match self.store.cleanup_expired().await {
            Ok(removed) => report.expired = removed,
            Err(e) => tracing::warn!(error = %e, "expired record cleanup failed"),
        }

        if report != ReapReport::default() {
            tracing::info!(
                reclaimed = report.reclaimed,
                abandoned = report.abandoned,
                republished = report.republished,
                publish_failures = report.publish_failures,
                expired = report.expired,
                "reaper sweep finished"
            );
        }
        Ok(report)
    }

    async fn republish(
        &self,
        correlation_id: &str,
        payload: Payload,
        report: &mut ReapReport,
    ) -> bool {
        let event = TaskEvent::work(correlation_id, payload);
        match self.bus.publish(&self.config.work_topic, &event).await {
            Ok(_) => true,
            Err(e) => {
                report.publish_failures += 1;
                tracing::warn!(%correlation_id, error = %e, "failed to republish work event");
                false
            },
        }
    }

    /// Sweeps every `scan_interval` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            grace_secs = self.config.grace_period.as_secs(),
            max_attempts = self.config.max_attempts,
            "reaper started"
        );
        let mut interval = tokio::time::interval(self.config.scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::warn!(error = %e, "reaper sweep failed");
                    }
                },
            }
        }
        tracing::info!("reaper stopped");
    }
}
