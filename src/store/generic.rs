//! [`GenericTaskStore`]: task semantics layered over any [`StorageBackend`].
//!
//! [`GenericTaskStore`] implements every domain operation (status machine
//! transitions, TTL policy, CAS-based mutations, JSON serialization) on top of
//! any [`StorageBackend`] implementation.
//!
//! The status machine, expiry policy and CAS retries live here, so every
//! backend gets them for free.
//!
//! # CAS Semantics
//!
//! Every mutation except `create` is a read-modify-write loop over
//! [`StorageBackend::put_if_version`]. A version conflict re-reads the record
//! and re-runs the status checks against the fresh copy, so a lost race
//! surfaces as [`TaskError::Conflict`] rather than a silent overwrite. The
//! loop is bounded by [`StoreConfig::cas_retries`]; exhaustion surfaces as
//! [`TaskError::Contended`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::record::expiry_after;
use crate::domain::{Payload, TaskRecord, TaskStatus, TaskUpdate};
use crate::error::TaskError;
use crate::store::backend::{make_key, make_prefix, StorageBackend, StorageError};
use crate::store::{ReclaimOutcome, StoreConfig, TaskStore};

/// Task store over a pluggable [`StorageBackend`].
///
/// # Type Parameters
///
/// * `B` - A [`StorageBackend`] implementation (in-memory, Redis, ...)
///
/// # Examples
///
/// ```
/// use taskbridge::store::{GenericTaskStore, InMemoryBackend, TaskStore};
/// use taskbridge::{Payload, TaskStatus, TaskUpdate};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = GenericTaskStore::new(InMemoryBackend::new());
/// store.create("c-1", Payload::text("hello")).await.unwrap();
/// let claimed = store
///     .transition("c-1", TaskStatus::Pending, TaskUpdate::Processing)
///     .await
///     .unwrap();
/// assert_eq!(claimed.status, TaskStatus::Processing);
/// # }
/// ```
#[derive(Debug)]
pub struct GenericTaskStore<B: StorageBackend> {
    backend: B,
    config: StoreConfig,
}

impl<B: StorageBackend> GenericTaskStore<B> {
    /// Creates a store with `StoreConfig::default()`.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: StoreConfig::default(),
        }
    }

    /// Replaces the default [`StoreConfig`].
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Active settings.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The backend records are written to.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn key(&self, correlation_id: &str) -> String {
        make_key(&self.config.namespace, correlation_id)
    }

    fn serialize_record(record: &TaskRecord) -> Result<Vec<u8>, TaskError> {
        serde_json::to_vec(record).map_err(|e| TaskError::Corrupt {
            correlation_id: record.correlation_id.clone(),
            message: format!("failed to serialize task record: {e}"),
        })
    }

    fn deserialize_record(correlation_id: &str, data: &[u8]) -> Result<TaskRecord, TaskError> {
        serde_json::from_slice(data).map_err(|e| TaskError::Corrupt {
            correlation_id: correlation_id.to_string(),
            message: format!("failed to deserialize task record: {e}"),
        })
    }

    fn map_storage_error(err: StorageError, correlation_id: &str) -> TaskError {
        match err {
            StorageError::NotFound { .. } => TaskError::NotFound {
                correlation_id: correlation_id.to_string(),
            },
            StorageError::AlreadyExists { .. } => TaskError::AlreadyExists {
                correlation_id: correlation_id.to_string(),
            },
            StorageError::VersionConflict { .. } => TaskError::Contended {
                correlation_id: correlation_id.to_string(),
                attempts: 1,
            },
            StorageError::Backend { message, .. } => TaskError::TransientStore(message),
        }
    }

    async fn read(&self, correlation_id: &str) -> Result<TaskRecord, TaskError> {
        let versioned = self
            .backend
            .get(&self.key(correlation_id))
            .await
            .map_err(|e| Self::map_storage_error(e, correlation_id))?;
        let mut record = Self::deserialize_record(correlation_id, &versioned.data)?;
        record.version = versioned.version;
        if record.is_expired() {
            return Err(TaskError::NotFound {
                correlation_id: correlation_id.to_string(),
            });
        }
        Ok(record)
    }

    /// Optimistic read-modify-write.
    ///
    /// `mutate` edits the freshly read record and returns whether it should
    /// be written. It is re-run on every round, so it must only depend on the
    /// record it is given. Returns `None` when `mutate` declined to write.
    async fn modify<F>(
        &self,
        correlation_id: &str,
        mut mutate: F,
    ) -> Result<Option<TaskRecord>, TaskError>
    where
        F: FnMut(&mut TaskRecord) -> Result<bool, TaskError> + Send,
    {
        let key = self.key(correlation_id);
        let rounds = self.config.cas_retries.max(1);
        for round in 1..=rounds {
            let mut record = self.read(correlation_id).await?;
            let read_version = record.version;
            if !mutate(&mut record)? {
                return Ok(None);
            }
            let bytes = Self::serialize_record(&record)?;
            match self
                .backend
                .put_if_version(&key, &bytes, read_version, record.expires_at)
                .await
            {
                Ok(version) => {
                    record.version = version;
                    return Ok(Some(record));
                },
                Err(StorageError::NotFound { .. })
                | Err(StorageError::VersionConflict { actual: 0, .. }) => {
                    return Err(TaskError::NotFound {
                        correlation_id: correlation_id.to_string(),
                    });
                },
                Err(StorageError::VersionConflict {
                    expected, actual, ..
                }) => {
                    tracing::debug!(
                        correlation_id,
                        round,
                        expected,
                        actual,
                        "version conflict, re-reading task"
                    );
                },
                Err(e) => return Err(Self::map_storage_error(e, correlation_id)),
            }
        }
        Err(TaskError::Contended {
            correlation_id: correlation_id.to_string(),
            attempts: rounds,
        })
    }
}

#[async_trait]
impl<B: StorageBackend + 'static> TaskStore for GenericTaskStore<B> {
    async fn create(
        &self,
        correlation_id: &str,
        payload: Payload,
    ) -> Result<TaskRecord, TaskError> {
        let mut record = TaskRecord::new(correlation_id.to_string(), payload, self.config.task_ttl);
        let bytes = Self::serialize_record(&record)?;
        let version = self
            .backend
            .insert(&self.key(correlation_id), &bytes, record.expires_at)
            .await
            .map_err(|e| Self::map_storage_error(e, correlation_id))?;
        record.version = version;
        tracing::debug!(correlation_id, version, "task created");
        Ok(record)
    }

    async fn get(&self, correlation_id: &str) -> Result<TaskRecord, TaskError> {
        self.read(correlation_id).await
    }

    async fn transition(
        &self,
        correlation_id: &str,
        expected: TaskStatus,
        update: TaskUpdate,
    ) -> Result<TaskRecord, TaskError> {
        let target = update.status();
        expected.validate_transition(correlation_id, &target)?;
        let terminal_ttl = self.config.terminal_ttl;

        let written = self
            .modify(correlation_id, |record| {
                if record.status != expected {
                    return Err(TaskError::Conflict {
                        correlation_id: record.correlation_id.clone(),
                        expected,
                        actual: record.status,
                    });
                }
                record.apply(update.clone(), terminal_ttl);
                Ok(true)
            })
            .await?;

        match written {
            Some(record) => {
                tracing::debug!(
                    correlation_id,
                    from = %expected,
                    to = %target,
                    version = record.version,
                    "task transitioned"
                );
                Ok(record)
            },
            // `modify` only declines when the closure returns `false`.
            None => Err(TaskError::NotFound {
                correlation_id: correlation_id.to_string(),
            }),
        }
    }

    async fn touch_ttl(&self, correlation_id: &str) -> Result<TaskRecord, TaskError> {
        let task_ttl = self.config.task_ttl;
        self.modify(correlation_id, |record| {
            record.expires_at = expiry_after(Utc::now(), task_ttl);
            Ok(true)
        })
        .await?
        .ok_or_else(|| TaskError::NotFound {
            correlation_id: correlation_id.to_string(),
        })
    }

    async fn delete(&self, correlation_id: &str) -> Result<bool, TaskError> {
        self.backend
            .delete(&self.key(correlation_id))
            .await
            .map_err(|e| Self::map_storage_error(e, correlation_id))
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, TaskError> {
        let prefix = make_prefix(&self.config.namespace);
        let entries = self
            .backend
            .list_by_prefix(&prefix)
            .await
            .map_err(|e| Self::map_storage_error(e, ""))?;

        let mut tasks: Vec<TaskRecord> = entries
            .into_iter()
            .filter_map(|(key, versioned)| {
                match serde_json::from_slice::<TaskRecord>(&versioned.data) {
                    Ok(mut record) => {
                        record.version = versioned.version;
                        Some(record)
                    },
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "skipping undecodable task record");
                        None
                    },
                }
            })
            .filter(|record| !record.is_expired())
            .filter(|record| status.map_or(true, |wanted| record.status == wanted))
            .collect();

        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn reclaim(
        &self,
        correlation_id: &str,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<ReclaimOutcome, TaskError> {
        let terminal_ttl = self.config.terminal_ttl;
        let mut abandoned = false;

        let written = self
            .modify(correlation_id, |record| {
                if record.status != TaskStatus::Processing || record.updated_at >= stale_before {
                    return Ok(false);
                }
                if record.attempts >= max_attempts {
                    abandoned = true;
                    let reason = format!(
                        "abandoned after {} attempts without completion",
                        record.attempts
                    );
                    record.apply(TaskUpdate::Failed(reason), terminal_ttl);
                } else {
                    abandoned = false;
                    record.status = TaskStatus::Pending;
                    record.attempts += 1;
                    record.updated_at = Utc::now();
                }
                Ok(true)
            })
            .await;

        match written {
            Ok(Some(record)) if abandoned => {
                tracing::warn!(
                    correlation_id,
                    attempts = record.attempts,
                    "stale task abandoned"
                );
                Ok(ReclaimOutcome::Abandoned(record))
            },
            Ok(Some(record)) => {
                tracing::info!(
                    correlation_id,
                    attempts = record.attempts,
                    "stale task reclaimed"
                );
                Ok(ReclaimOutcome::Reclaimed(record))
            },
            Ok(None) | Err(TaskError::NotFound { .. }) => Ok(ReclaimOutcome::Skipped),
            Err(e) => Err(e),
        }
    }

    async fn requeue(
        &self,
        correlation_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, TaskError> {
        let written = self
            .modify(correlation_id, |record| {
                if record.status != TaskStatus::Pending || record.updated_at >= stale_before {
                    return Ok(false);
                }
                record.updated_at = Utc::now();
                Ok(true)
            })
            .await;
        match written {
            Ok(record) => Ok(record),
            Err(TaskError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn cleanup_expired(&self) -> Result<usize, TaskError> {
        self.backend
            .cleanup_expired()
            .await
            .map_err(|e| Self::map_storage_error(e, ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::VersionedRecord;
    use crate::store::memory::InMemoryBackend;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_store() -> GenericTaskStore<InMemoryBackend> {
        GenericTaskStore::new(InMemoryBackend::new())
    }

    // ---- Create / get ----

    #[tokio::test]
    async fn create_returns_pending_task() {
        let store = test_store();
        let record = store.create("c-1", Payload::text("in")).await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.correlation_id, "c-1");
        assert_eq!(record.version, 1);
        assert!(record.expires_at.is_some());
    }

    #[tokio::test]
    async fn create_duplicate_is_rejected() {
        let store = test_store();
        store.create("c-1", Payload::text("a")).await.unwrap();
        let err = store.create("c-1", Payload::text("b")).await.unwrap_err();
        assert!(matches!(err, TaskError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn records_use_namespaced_keys() {
        let store = test_store();
        store.create("c-1", Payload::text("a")).await.unwrap();
        assert!(store.backend().get("task:c-1").await.is_ok());
    }

    #[tokio::test]
    async fn get_missing_returns_not_found() {
        let store = test_store();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound { .. }));
    }

    #[tokio::test]
    async fn get_corrupt_record_returns_corrupt() {
        let store = test_store();
        store
            .backend()
            .insert("task:bad", b"not json", None)
            .await
            .unwrap();
        let err = store.get("bad").await.unwrap_err();
        assert!(matches!(err, TaskError::Corrupt { .. }));
    }

    // ---- Transition ----

    #[tokio::test]
    async fn transition_rejects_wrong_expected_status() {
        let store = test_store();
        store.create("c-1", Payload::text("a")).await.unwrap();
        let err = store
            .transition(
                "c-1",
                TaskStatus::Processing,
                TaskUpdate::Completed(Payload::text("x")),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::Conflict {
                expected: TaskStatus::Processing,
                actual: TaskStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn transition_rejects_skipping_processing() {
        let store = test_store();
        store.create("c-1", Payload::text("a")).await.unwrap();
        let err = store
            .transition(
                "c-1",
                TaskStatus::Pending,
                TaskUpdate::Completed(Payload::text("x")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        assert_eq!(store.get("c-1").await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_transition_shortens_expiry() {
        let store = test_store().with_config(StoreConfig {
            terminal_ttl: Some(Duration::from_secs(5)),
            ..StoreConfig::default()
        });
        let created = store.create("c-1", Payload::text("a")).await.unwrap();
        store
            .transition("c-1", TaskStatus::Pending, TaskUpdate::Processing)
            .await
            .unwrap();
        let done = store
            .transition(
                "c-1",
                TaskStatus::Processing,
                TaskUpdate::Completed(Payload::text("b")),
            )
            .await
            .unwrap();
        assert!(done.expires_at.unwrap() < created.expires_at.unwrap());
    }

    // ---- TTL ----

    #[tokio::test]
    async fn touch_ttl_extends_expiry() {
        let store = test_store();
        let created = store.create("c-1", Payload::text("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let touched = store.touch_ttl("c-1").await.unwrap();
        assert!(touched.expires_at.unwrap() > created.expires_at.unwrap());
        assert_eq!(touched.version, created.version + 1);
    }

    #[tokio::test]
    async fn expired_task_reads_as_not_found() {
        let store = test_store().with_config(StoreConfig {
            task_ttl: Some(Duration::ZERO),
            ..StoreConfig::default()
        });
        store.create("c-1", Payload::text("a")).await.unwrap();
        assert!(matches!(
            store.get("c-1").await,
            Err(TaskError::NotFound { .. })
        ));
        // An expired id can be reused.
        store.create("c-1", Payload::text("b")).await.unwrap();
    }

    // ---- List / reclaim ----

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = test_store();
        store.create("a", Payload::text("1")).await.unwrap();
        store.create("b", Payload::text("2")).await.unwrap();
        store
            .transition("b", TaskStatus::Pending, TaskUpdate::Processing)
            .await
            .unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let processing = store.list(Some(TaskStatus::Processing)).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].correlation_id, "b");
    }

    #[tokio::test]
    async fn reclaim_skips_fresh_claims() {
        let store = test_store();
        store.create("c-1", Payload::text("a")).await.unwrap();
        store
            .transition("c-1", TaskStatus::Pending, TaskUpdate::Processing)
            .await
            .unwrap();
        let stale_before = Utc::now() - ChronoDuration::seconds(60);
        let outcome = store.reclaim("c-1", stale_before, 5).await.unwrap();
        assert_eq!(outcome, ReclaimOutcome::Skipped);
    }

    #[tokio::test]
    async fn requeue_stamps_idle_pending_task_once() {
        let store = test_store();
        let created = store.create("c-1", Payload::text("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stale_before = Utc::now();

        let stamped = store.requeue("c-1", stale_before).await.unwrap().unwrap();
        assert!(stamped.updated_at >= stale_before);
        assert_eq!(stamped.status, TaskStatus::Pending);
        assert_eq!(stamped.expires_at, created.expires_at);

        // Same window: the task no longer counts as idle.
        assert_eq!(store.requeue("c-1", stale_before).await.unwrap(), None);
        assert_eq!(store.requeue("missing", stale_before).await.unwrap(), None);

        store
            .transition("c-1", TaskStatus::Pending, TaskUpdate::Processing)
            .await
            .unwrap();
        let later = Utc::now() + ChronoDuration::seconds(1);
        assert_eq!(store.requeue("c-1", later).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reclaim_resets_stale_claim_to_pending() {
        let store = test_store();
        store.create("c-1", Payload::text("a")).await.unwrap();
        store
            .transition("c-1", TaskStatus::Pending, TaskUpdate::Processing)
            .await
            .unwrap();
        let stale_before = Utc::now() + ChronoDuration::seconds(1);
        match store.reclaim("c-1", stale_before, 5).await.unwrap() {
            ReclaimOutcome::Reclaimed(record) => {
                assert_eq!(record.status, TaskStatus::Pending);
                assert_eq!(record.attempts, 1);
            },
            other => panic!("expected Reclaimed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reclaim_abandons_after_max_attempts() {
        let store = test_store();
        store.create("c-1", Payload::text("a")).await.unwrap();
        store
            .transition("c-1", TaskStatus::Pending, TaskUpdate::Processing)
            .await
            .unwrap();
        let stale_before = Utc::now() + ChronoDuration::seconds(1);
        match store.reclaim("c-1", stale_before, 0).await.unwrap() {
            ReclaimOutcome::Abandoned(record) => {
                assert_eq!(record.status, TaskStatus::Failed);
                assert!(record.error.unwrap().contains("abandoned"));
            },
            other => panic!("expected Abandoned, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reclaim_missing_task_is_skipped() {
        let store = test_store();
        let outcome = store.reclaim("ghost", Utc::now(), 5).await.unwrap();
        assert_eq!(outcome, ReclaimOutcome::Skipped);
    }

    // ---- CAS behavior ----

    /// Backend whose `put_if_version` always reports a concurrent writer.
    struct AlwaysStaleBackend {
        inner: Arc<InMemoryBackend>,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl StorageBackend for AlwaysStaleBackend {
        async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
            self.inner.get(key).await
        }
        async fn insert(
            &self,
            key: &str,
            data: &[u8],
            expires_at: Option<DateTime<Utc>>,
        ) -> Result<u64, StorageError> {
            self.inner.insert(key, data, expires_at).await
        }
        async fn put_if_version(
            &self,
            key: &str,
            _data: &[u8],
            expected_version: u64,
            _expires_at: Option<DateTime<Utc>>,
        ) -> Result<u64, StorageError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: expected_version + 1,
            })
        }
        async fn delete(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.delete(key).await
        }
        async fn list_by_prefix(
            &self,
            prefix: &str,
        ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
            self.inner.list_by_prefix(prefix).await
        }
        async fn cleanup_expired(&self) -> Result<usize, StorageError> {
            self.inner.cleanup_expired().await
        }
    }

    #[tokio::test]
    async fn exhausted_cas_rounds_report_contended() {
        let store = GenericTaskStore::new(AlwaysStaleBackend {
            inner: Arc::new(InMemoryBackend::new()),
            attempts: AtomicU32::new(0),
        })
        .with_config(StoreConfig {
            cas_retries: 3,
            ..StoreConfig::default()
        });
        store.create("c-1", Payload::text("a")).await.unwrap();
        let err = store
            .transition("c-1", TaskStatus::Pending, TaskUpdate::Processing)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Contended { attempts: 3, .. }));
        assert!(err.is_transient());
        assert_eq!(store.backend().attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrent_claims_admit_exactly_one() {
        let store = Arc::new(test_store());
        store.create("c-1", Payload::text("a")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .transition("c-1", TaskStatus::Pending, TaskUpdate::Processing)
                    .await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(TaskError::Conflict { .. }) => {},
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
    }
}
