//! The worker loop: claim, compute, record, signal.
//!
//! For every work event the loop:
//!
//! 1. reads the task and drops the event if the task is gone;
//! 2. drops the event as a duplicate if the task is no longer `Pending`;
//! 3. claims the task with `Pending -> Processing`, dropping the event if
//!    another worker won the claim;
//! 4. runs the compute step under a timeout and records `Completed` or
//!    `Failed` with `Processing -> ...`;
//! 5. publishes a completion event when a result topic is configured.
//!
//! Step 3 is the only place a task is claimed, and the store's
//! compare-and-set admits exactly one claimant, so duplicate deliveries
//! never run the compute step twice. Nothing is retried automatically once
//! compute has run; a failure is recorded and surfaced to the submitter.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bus::{consume, Delivery, EventKind, MessageBus, Subscription, TaskEvent};
use crate::compute::{Compute, ComputeError};
use crate::domain::{Payload, PayloadSchema, TaskStatus, TaskUpdate};
use crate::error::TaskError;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::TaskStore;

/// Default upper bound for one compute call.
pub const DEFAULT_COMPUTE_TIMEOUT: Duration = Duration::from_secs(120);

/// Worker loop settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Topic work events are read from.
    pub work_topic: String,
    /// Topic completion events are published to. `None` disables them.
    pub result_topic: Option<String>,
    /// Consumer group shared by all workers.
    pub group: String,
    /// This worker's consumer name.
    pub consumer: String,
    /// How many events are handled at once.
    pub concurrency: usize,
    /// Upper bound for one compute call.
    pub compute_timeout: Duration,
    /// When set, payloads with any other schema fail without computing.
    pub accepted_schema: Option<PayloadSchema>,
    /// Deliveries per bus read.
    pub batch_size: usize,
    /// How long one bus read may block.
    pub receive_wait: Duration,
    /// Visibility timeout for leased deliveries.
    pub lease: Duration,
    /// Pause after a failed bus read.
    pub receive_backoff: Duration,
    /// Retry policy for the terminal store write.
    pub store_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            work_topic: "taskbridge.work".to_string(),
            result_topic: Some("taskbridge.results".to_string()),
            group: "taskbridge-workers".to_string(),
            consumer: format!("worker-{}", uuid::Uuid::new_v4().simple()),
            concurrency: 4,
            compute_timeout: DEFAULT_COMPUTE_TIMEOUT,
            accepted_schema: None,
            batch_size: 16,
            receive_wait: Duration::from_secs(2),
            lease: Duration::from_secs(30),
            receive_backoff: Duration::from_secs(1),
            store_retry: RetryPolicy::new(
                5,
                Backoff::new(Duration::from_millis(100), Duration::from_secs(2)),
            ),
        }
    }
}

/// Why an event was handled without running compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The event was not a work event.
    NotWork,
    /// The task does not exist or has expired.
    NotFound,
    /// The task had already left `Pending`.
    Duplicate(TaskStatus),
    /// Another worker claimed the task first.
    ClaimLost,
    /// The claim was reclaimed while computing; the result was discarded.
    StaleClaim,
}

/// What handling one event amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The task was claimed and completed.
    Completed,
    /// The task was claimed and recorded as failed.
    Failed(String),
    /// Nothing was computed.
    Dropped(DropReason),
}

/// Consumes work events and drives tasks to a terminal status.
pub struct WorkerLoop {
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
    compute: Arc<dyn Compute>,
    config: WorkerConfig,
}

impl std::fmt::Debug for WorkerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLoop")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkerLoop {
    /// Creates a worker over the given collaborators.
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: Arc<dyn MessageBus>,
        compute: Arc<dyn Compute>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            compute,
            config,
        }
    }

    /// Returns the worker's configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Consumes work events until `shutdown` is cancelled.
    ///
    /// Handlers already running when shutdown fires are allowed to finish.
    /// Errors never end the loop: transient failures release the delivery
    /// for redelivery and bus read failures are retried after a pause.
    pub async fn run(&self, shutdown: CancellationToken) {
        let subscription = Subscription::new(
            self.config.work_topic.clone(),
            self.config.group.clone(),
            self.config.consumer.clone(),
        )
        .with_batch_size(self.config.batch_size)
        .with_wait(self.config.receive_wait)
        .with_lease(self.config.lease);

        tracing::info!(
            topic = %self.config.work_topic,
            group = %self.config.group,
            consumer = %self.config.consumer,
            concurrency = self.config.concurrency,
            "worker started"
        );

        consume(Arc::clone(&self.bus), subscription)
            .take_until(shutdown.cancelled_owned())
            .for_each_concurrent(self.config.concurrency.max(1), |item| async move {
                match item {
                    Ok(delivery) => self.handle_delivery(delivery).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "bus read failed");
                        tokio::time::sleep(self.config.receive_backoff).await;
                    },
                }
            })
            .await;

        tracing::info!(consumer = %self.config.consumer, "worker stopped");
    }

    /// Handles one delivery and settles it with the bus.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        let correlation_id = delivery.event.correlation_id.clone();
        match self.handle_event(&delivery.event).await {
            Ok(outcome) => {
                tracing::debug!(%correlation_id, ?outcome, "event handled");
                if let Err(e) = self.bus.ack(&delivery).await {
                    tracing::warn!(%correlation_id, error = %e, "failed to ack delivery");
                }
            },
            Err(e) if e.is_transient() => {
                tracing::warn!(%correlation_id, error = %e, "transient failure, releasing delivery");
                if let Err(e) = self.bus.nack(&delivery).await {
                    tracing::warn!(%correlation_id, error = %e, "failed to nack delivery");
                }
            },
            Err(e) => {
                tracing::error!(%correlation_id, error = %e, "unprocessable event, discarding");
                if let Err(e) = self.bus.ack(&delivery).await {
                    tracing::warn!(%correlation_id, error = %e, "failed to ack delivery");
                }
            },
        }
    }

    /// Runs the claim/compute/record sequence for one event.
    ///
    /// Returns `Err` only for store failures before the claim or a terminal
    /// write that could not be made; a duplicate or lost claim is an `Ok`
    /// [`ProcessOutcome::Dropped`].
    #[tracing::instrument(skip(self, event), fields(correlation_id = %event.correlation_id))]
    pub async fn handle_event(&self, event: &TaskEvent) -> Result<ProcessOutcome, TaskError> {
        if event.kind != EventKind::Work {
            return Ok(ProcessOutcome::Dropped(DropReason::NotWork));
        }
        let correlation_id = event.correlation_id.as_str();

        let record = match self.store.get(correlation_id).await {
            Ok(record) => record,
            Err(TaskError::NotFound { .. }) => {
                tracing::warn!("task not found, dropping event");
                return Ok(ProcessOutcome::Dropped(DropReason::NotFound));
            },
            Err(e) => return Err(e),
        };

        if record.status != TaskStatus::Pending {
            tracing::info!(status = %record.status, "task no longer pending, dropping duplicate");
            return Ok(ProcessOutcome::Dropped(DropReason::Duplicate(record.status)));
        }

        match self
            .store
            .transition(correlation_id, TaskStatus::Pending, TaskUpdate::Processing)
            .await
        {
            Ok(_) => {},
            Err(TaskError::Conflict { actual, .. }) => {
                tracing::info!(status = %actual, "claim lost to another worker");
                return Ok(ProcessOutcome::Dropped(DropReason::ClaimLost));
            },
            Err(TaskError::NotFound { .. }) => {
                return Ok(ProcessOutcome::Dropped(DropReason::NotFound));
            },
            Err(e) => return Err(e),
        }
        tracing::info!("task claimed");

        let update = match self.run_compute(&record.payload).await {
            Ok(result) => TaskUpdate::Completed(result),
            Err(e) => {
                tracing::warn!(error = %e, "compute failed");
                TaskUpdate::Failed(e.to_string())
            },
        };
        self.finish(correlation_id, update).await
    }

    async fn run_compute(&self, payload: &Payload) -> Result<Payload, ComputeError> {
        if let Some(expected) = &self.config.accepted_schema {
            if !payload.conforms_to(expected) {
                return Err(ComputeError::UnsupportedSchema {
                    found: payload.schema(),
                    expected: expected.clone(),
                });
            }
        }
        let limit = self.config.compute_timeout;
        match tokio::time::timeout(limit, self.compute.compute(payload)).await {
            Ok(result) => result,
            Err(_) => Err(ComputeError::TimedOut(limit)),
        }
    }

    async fn finish(
        &self,
        correlation_id: &str,
        update: TaskUpdate,
    ) -> Result<ProcessOutcome, TaskError> {
        let written = self
            .config
            .store_retry
            .run(
                || {
                    self.store
                        .transition(correlation_id, TaskStatus::Processing, update.clone())
                },
                TaskError::is_transient,
            )
            .await;

        let record = match written {
            Ok(record) => record,
            Err(TaskError::Conflict { actual, .. }) => {
                tracing::warn!(status = %actual, "claim was reclaimed during compute, discarding result");
                return Ok(ProcessOutcome::Dropped(DropReason::StaleClaim));
            },
            Err(TaskError::NotFound { .. }) => {
                tracing::warn!("task expired during compute, discarding result");
                return Ok(ProcessOutcome::Dropped(DropReason::StaleClaim));
            },
            Err(e) => return Err(e),
        };
        tracing::info!(status = %record.status, "task finished");

        if let Some(topic) = &self.config.result_topic {
            let event =
                TaskEvent::completion(correlation_id, record.status, record.result.clone());
            if let Err(e) = self.bus.publish(topic, &event).await {
                tracing::warn!(topic = %topic, error = %e, "failed to publish completion event");
            }
        }

        Ok(match update {
            TaskUpdate::Failed(reason) => ProcessOutcome::Failed(reason),
            _ => ProcessOutcome::Completed,
        })
    }
}
