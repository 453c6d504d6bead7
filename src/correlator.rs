//! Front-end side of the bridge: submit work, then wait for its outcome.
//!
//! [`Correlator::submit`] writes a `Pending` record and publishes a work
//! event; [`Correlator::await_result`] polls the store with capped
//! exponential backoff until the task is terminal or the caller's deadline
//! passes. Waiting is read-only: giving up never changes the task, and a
//! later `await_result` for the same id picks up where the first left off.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::bus::{BusError, MessageBus, TaskEvent};
use crate::domain::{Payload, TaskRecord, TaskStatus, TaskUpdate};
use crate::error::TaskError;
use crate::retry::{deadline_after, Backoff, RetryPolicy};
use crate::store::TaskStore;

/// Fresh identifiers tried before a collision is reported.
const ID_ATTEMPTS: u32 = 3;

/// Why a submission did not go through.
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The task record could not be created.
    #[error(transparent)]
    Store(#[from] TaskError),

    /// The record was created but the work event never reached the bus.
    /// The task has been marked `Failed` where possible.
    #[error("work event for task {correlation_id} could not be published: {source}")]
    Publish {
        /// The task that was created.
        correlation_id: String,
        /// The last publish failure.
        #[source]
        source: BusError,
    },
}

/// Errors surfaced by the correlator's read side.
#[derive(Error, Debug)]
pub enum CorrelatorError {
    /// Store failure, including `NotFound` for unknown or expired ids.
    #[error(transparent)]
    Store(#[from] TaskError),

    /// Submission failure from [`Correlator::submit_and_wait`].
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwaitOutcome {
    /// The task completed with this result.
    Completed(Payload),
    /// The task failed with this diagnostic.
    Failed(String),
    /// The deadline passed first. The task may still finish; check later.
    TimedOut,
}

impl AwaitOutcome {
    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::TimedOut)
    }
}

/// Correlator settings.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Topic work events are published to.
    pub work_topic: String,
    /// Polling cadence for [`Correlator::await_result`].
    pub poll: Backoff,
    /// Retry policy for publishing the work event.
    pub publish_retry: RetryPolicy,
    /// Wait used by [`Correlator::submit_and_wait`] when none is given.
    pub default_timeout: Duration,
    /// Delete records once a wait observes a terminal status.
    ///
    /// Only enable this when each task has a single waiter. The first wait
    /// to see the outcome deletes the record, so any other caller waiting
    /// on the same id gets [`TaskError::NotFound`] instead of the outcome.
    /// With the default `false`, any number of callers may wait on one id
    /// and the record lapses with the store's terminal TTL.
    pub release_on_terminal: bool,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            work_topic: "taskbridge.work".to_string(),
            poll: Backoff::new(Duration::from_millis(250), Duration::from_secs(2)),
            publish_retry: RetryPolicy::new(
                5,
                Backoff::new(Duration::from_millis(100), Duration::from_secs(2)),
            ),
            default_timeout: Duration::from_secs(300),
            release_on_terminal: false,
        }
    }
}

/// Submits tasks and reunites them with their results.
pub struct Correlator {
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
    config: CorrelatorConfig,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Correlator {
    /// Creates a correlator over the given store and bus.
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: Arc<dyn MessageBus>,
        config: CorrelatorConfig,
    ) -> Self {
        Self { store, bus, config }
    }

    /// Returns the correlator's configuration.
    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Creates a task under a fresh UUIDv4 and publishes its work event.
    ///
    /// An id collision is retried with a new id. If the work event cannot be
    /// published after the configured retries, the task is marked `Failed`
    /// (best effort) and [`SubmitError::Publish`] is returned.
    pub async fn submit(&self, payload: Payload) -> Result<String, SubmitError> {
        let mut attempt = 1;
        loop {
            let correlation_id = uuid::Uuid::new_v4().to_string();
            match self.store.create(&correlation_id, payload.clone()).await {
                Ok(_) => {
                    self.dispatch(&correlation_id, payload).await?;
                    return Ok(correlation_id);
                },
                Err(TaskError::AlreadyExists { .. }) if attempt < ID_ATTEMPTS => {
                    tracing::warn!(%correlation_id, "correlation id collision, retrying");
                    attempt += 1;
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Like [`submit`](Self::submit) with a caller-chosen id.
    ///
    /// # Errors
    ///
    /// [`TaskError::AlreadyExists`] (wrapped) if a live task holds the id.
    pub async fn submit_with_id(
        &self,
        correlation_id: &str,
        payload: Payload,
    ) -> Result<(), SubmitError> {
        self.store.create(correlation_id, payload.clone()).await?;
        self.dispatch(correlation_id, payload).await
    }

    async fn dispatch(&self, correlation_id: &str, payload: Payload) -> Result<(), SubmitError> {
        let event = TaskEvent::work(correlation_id, payload);
        let topic = self.config.work_topic.as_str();
        let published = self
            .config
            .publish_retry
            .run(|| self.bus.publish(topic, &event), BusError::is_transient)
            .await;

        match published {
            Ok(_) => {
                tracing::info!(%correlation_id, topic, "task submitted");
                Ok(())
            },
            Err(source) => {
                tracing::error!(%correlation_id, topic, error = %source, "failed to publish work event");
                let reason = format!("work event could not be published: {source}");
                if let Err(e) = self
                    .store
                    .transition(correlation_id, TaskStatus::Pending, TaskUpdate::Failed(reason))
                    .await
                {
                    tracing::warn!(%correlation_id, error = %e, "could not mark unpublished task as failed");
                }
                Err(SubmitError::Publish {
                    correlation_id: correlation_id.to_string(),
                    source,
                })
            },
        }
    }

    /// Waits up to `timeout` for the task to become terminal.
    ///
    /// The store is read at least once, so a zero timeout is a single
    /// check. Transient store errors are logged and polling continues until
    /// the deadline.
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] (wrapped) if the id is unknown or expired.
    pub async fn await_result(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<AwaitOutcome, CorrelatorError> {
        let deadline = deadline_after(Instant::now(), timeout);
        let mut attempt = 0;
        loop {
            match self.store.get(correlation_id).await {
                Ok(record) => {
                    if let Some(outcome) = terminal_outcome(record) {
                        tracing::debug!(%correlation_id, ?outcome, "task observed terminal");
                        if self.config.release_on_terminal {
                            if let Err(e) = self.release(correlation_id).await {
                                tracing::warn!(%correlation_id, error = %e, "failed to release task");
                            }
                        }
                        return Ok(outcome);
                    }
                },
                Err(e) if e.is_transient() => {
                    tracing::warn!(%correlation_id, error = %e, "transient store error while waiting");
                },
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::info!(%correlation_id, "wait timed out");
                return Ok(AwaitOutcome::TimedOut);
            }
            let delay = self.config.poll.delay(attempt).min(deadline - now);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Submits and waits in one call. `timeout` defaults to
    /// [`CorrelatorConfig::default_timeout`].
    pub async fn submit_and_wait(
        &self,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<(String, AwaitOutcome), CorrelatorError> {
        let correlation_id = self.submit(payload).await?;
        let outcome = self
            .await_result(
                &correlation_id,
                timeout.unwrap_or(self.config.default_timeout),
            )
            .await?;
        Ok((correlation_id, outcome))
    }

    /// Reads the task's current record.
    pub async fn status(&self, correlation_id: &str) -> Result<TaskRecord, TaskError> {
        self.store.get(correlation_id).await
    }

    /// Pushes the task's expiry out by the store's task TTL.
    pub async fn extend(&self, correlation_id: &str) -> Result<TaskRecord, TaskError> {
        self.store.touch_ttl(correlation_id).await
    }

    /// Deletes the task after its result has been consumed.
    pub async fn release(&self, correlation_id: &str) -> Result<bool, TaskError> {
        self.store.delete(correlation_id).await
    }
}

fn terminal_outcome(record: TaskRecord) -> Option<AwaitOutcome> {
    match record.status {
        TaskStatus::Completed => Some(match record.result {
            Some(result) => AwaitOutcome::Completed(result),
            None => AwaitOutcome::Failed("task completed without a result".to_string()),
        }),
        TaskStatus::Failed => Some(AwaitOutcome::Failed(
            record
                .error
                .unwrap_or_else(|| "task failed without a diagnostic".to_string()),
        )),
        TaskStatus::Pending | TaskStatus::Processing => None,
    }
}
