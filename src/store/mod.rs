//! Task store trait, generic implementation, and supporting types.
//!
//! # Architecture
//!
//! The task storage system has three layers:
//!
//! 1. **[`TaskStore`]** -- A type-erasure interface used as
//!    `Arc<dyn TaskStore>` by the worker loop, the correlator and the reaper.
//!
//! 2. **[`GenericTaskStore<B>`](generic::GenericTaskStore)** -- All domain
//!    logic (status machine, TTL, CAS retry loop, JSON serialization). Has a
//!    blanket `TaskStore` impl.
//!
//! 3. **[`StorageBackend`]** -- Dumb versioned KV trait that backends
//!    implement (in-memory, Redis). No domain logic.
//!
//! # Backends
//!
//! - [`InMemoryBackend`](crate::store::memory::InMemoryBackend) -- `DashMap`
//!   backed, single process.
//! - [`RedisBackend`](crate::store::redis::RedisBackend) -- shared between
//!   processes. Available behind the `redis` feature flag.

pub mod backend;
pub mod generic;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use backend::{StorageBackend, StorageError, VersionedRecord};
pub use generic::GenericTaskStore;
pub use memory::InMemoryBackend;

use crate::domain::{Payload, TaskRecord, TaskStatus, TaskUpdate};
use crate::error::TaskError;

/// Store-wide settings applied by [`GenericTaskStore`].
///
/// # Defaults
///
/// | Setting        | Default | Description                                 |
/// |----------------|---------|---------------------------------------------|
/// | `namespace`    | `task`  | Key prefix, records live at `task:<id>`     |
/// | `task_ttl`     | 300 s   | Expiry applied on create and `touch_ttl`    |
/// | `terminal_ttl` | 60 s    | Expiry cap once a task becomes terminal     |
/// | `cas_retries`  | 8       | Optimistic rounds before `Contended`        |
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskbridge::store::StoreConfig;
///
/// let config = StoreConfig::default();
/// assert_eq!(config.namespace, "task");
/// assert_eq!(config.task_ttl, Some(Duration::from_secs(300)));
/// assert_eq!(config.terminal_ttl, Some(Duration::from_secs(60)));
/// assert_eq!(config.cas_retries, 8);
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Key namespace.
    pub namespace: String,

    /// TTL for live tasks. `None` disables expiry.
    pub task_ttl: Option<Duration>,

    /// TTL cap applied on reaching `Completed` or `Failed`. `None` keeps the
    /// task TTL.
    pub terminal_ttl: Option<Duration>,

    /// Maximum compare-and-set rounds per mutation.
    pub cas_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "task".to_string(),
            task_ttl: Some(Duration::from_secs(300)),
            terminal_ttl: Some(Duration::from_secs(60)),
            cas_retries: 8,
        }
    }
}

/// What [`TaskStore::reclaim`] did with a candidate record.
#[derive(Debug, Clone, PartialEq)]
pub enum ReclaimOutcome {
    /// The stale claim was reset to `Pending` and may be republished.
    Reclaimed(TaskRecord),
    /// The task ran out of attempts and was marked `Failed`.
    Abandoned(TaskRecord),
    /// The task was not a stale claim by the time the store looked at it.
    Skipped,
}

/// Type-erasure interface for task storage.
///
/// A blanket implementation is provided for `GenericTaskStore<B>` where
/// `B: StorageBackend + 'static`.
///
/// # Atomicity
///
/// [`transition`](TaskStore::transition) and [`reclaim`](TaskStore::reclaim)
/// are compare-and-set operations: of any number of concurrent callers
/// expecting the same status, at most one succeeds.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Creates a `Pending` task under `correlation_id`.
    ///
    /// # Errors
    ///
    /// - [`TaskError::AlreadyExists`] if a live record holds the id.
    /// - [`TaskError::TransientStore`] on backend failures.
    async fn create(&self, correlation_id: &str, payload: Payload)
        -> Result<TaskRecord, TaskError>;

    /// Reads a task. Expired records read as [`TaskError::NotFound`].
    async fn get(&self, correlation_id: &str) -> Result<TaskRecord, TaskError>;

    /// Moves a task from `expected` to the status carried by `update`.
    ///
    /// # Errors
    ///
    /// - [`TaskError::NotFound`] if the record is missing or expired.
    /// - [`TaskError::Conflict`] if the stored status is not `expected`.
    /// - [`TaskError::InvalidTransition`] if `expected` may not move to the
    ///   update's status.
    /// - [`TaskError::Contended`] if concurrent writers exhausted the CAS
    ///   retry budget.
    async fn transition(
        &self,
        correlation_id: &str,
        expected: TaskStatus,
        update: TaskUpdate,
    ) -> Result<TaskRecord, TaskError>;

    /// Resets the task's expiry to now plus the task TTL.
    async fn touch_ttl(&self, correlation_id: &str) -> Result<TaskRecord, TaskError>;

    /// Removes the task. Returns `false` if nothing was stored.
    async fn delete(&self, correlation_id: &str) -> Result<bool, TaskError>;

    /// Lists live tasks, optionally only those in `status`, oldest first.
    ///
    /// Records that fail to decode are skipped.
    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, TaskError>;

    /// Recovers a `Processing` task whose claim went stale.
    ///
    /// A task last updated before `stale_before` is moved back to `Pending`
    /// with `attempts + 1`, or to `Failed` once `attempts` has reached
    /// `max_attempts`. Anything else is [`ReclaimOutcome::Skipped`].
    async fn reclaim(
        &self,
        correlation_id: &str,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<ReclaimOutcome, TaskError>;

    /// Stamps a `Pending` task idle since before `stale_before` as just
    /// re-announced, by moving its `updated_at` to now.
    ///
    /// Returns the updated record, or `None` when the task was not an idle
    /// `Pending` task (or is gone). Concurrent callers race on the CAS, so at
    /// most one of them gets the record back per idle window.
    async fn requeue(
        &self,
        correlation_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, TaskError>;

    /// Removes expired records from backends without native expiry.
    async fn cleanup_expired(&self) -> Result<usize, TaskError>;
}
