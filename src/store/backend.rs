//! The versioned key-value contract that task records are persisted through.
//!
//! The [`StorageBackend`] trait is the contract every storage engine
//! implements: [`get`](StorageBackend::get),
//! [`insert`](StorageBackend::insert) (put-if-absent),
//! [`put_if_version`](StorageBackend::put_if_version) (compare-and-set),
//! [`delete`](StorageBackend::delete),
//! [`list_by_prefix`](StorageBackend::list_by_prefix) and
//! [`cleanup_expired`](StorageBackend::cleanup_expired).
//!
//! Status validation, TTL policy and serialization do **not** belong here.
//! Backends are dumb KV stores; domain logic lives in `GenericTaskStore`.
//!
//! # Key Structure
//!
//! Keys are `{namespace}:{correlation_id}`, e.g. `task:0b9c...`. Prefix
//! queries use `{namespace}:`.
//!
//! # Versioning
//!
//! Each stored record carries a `u64` version, at least 1, that strictly
//! increases on every successful write. `put_if_version` is the primitive
//! the whole bridge's mutual exclusion rests on.
//!
//! # Expiry
//!
//! Every write passes the record's absolute expiry explicitly. A backend
//! must treat an expired key as absent: `get` reports `NotFound`, `insert`
//! may overwrite it, and listings skip it.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Raw record bytes plus the version they were written at.
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    /// Serialized task record bytes (JSON).
    pub data: Vec<u8>,

    /// Monotonic version number, at least 1.
    pub version: u64,
}

/// Failures reported by a [`StorageBackend`].
///
/// `GenericTaskStore` maps these to [`TaskError`](crate::error::TaskError)
/// variants before surfacing them.
///
/// # Examples
///
/// ```
/// use taskbridge::store::backend::StorageError;
///
/// let err = StorageError::VersionConflict {
///     key: "task:abc".to_string(),
///     expected: 2,
///     actual: 3,
/// };
/// assert!(err.to_string().contains("expected 2"));
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// The requested key was not found (or has expired).
    NotFound {
        /// Missing key.
        key: String,
    },

    /// An [`insert`](StorageBackend::insert) found a live record.
    AlreadyExists {
        /// The occupied key.
        key: String,
    },

    /// A [`put_if_version`](StorageBackend::put_if_version) call found a
    /// different version than the caller expected.
    VersionConflict {
        /// Contended key.
        key: String,
        /// Version the writer held.
        expected: u64,
        /// The version found in storage (0 if the key vanished).
        actual: u64,
    },

    /// An I/O or backend-specific error (network failure, timeout, ...).
    Backend {
        /// What went wrong, for logs.
        message: String,
        /// The underlying error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "no record at {key}"),
            Self::AlreadyExists { key } => write!(f, "key already exists: {key}"),
            Self::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "stale write to {key}: expected {expected}, found {actual}"
            ),
            Self::Backend { message, .. } => write!(f, "storage backend failed: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Versioned byte storage shared by every store handle in the process.
///
/// Implementations must be `Send + Sync`; a single backend is shared by every
/// worker task and correlator call in the process.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a live record by key.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key is absent or expired.
    /// - [`StorageError::Backend`] on transport failures.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Stores a record only if no live record exists under `key`.
    ///
    /// Returns the assigned version. Versions handed out for a key never
    /// repeat, even across expiry, so a stale CAS token can never match the
    /// new record.
    ///
    /// # Errors
    ///
    /// - [`StorageError::AlreadyExists`] if a live record occupies the key.
    /// - [`StorageError::Backend`] on transport failures.
    async fn insert(
        &self,
        key: &str,
        data: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError>;

    /// Compare-and-set: replaces the record when it is still at `expected_version`.
    ///
    /// On success the version is incremented and returned.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] or [`StorageError::VersionConflict`]
    ///   (with `actual == 0`) if the key is gone; callers must handle both.
    /// - [`StorageError::VersionConflict`] on version mismatch.
    /// - [`StorageError::Backend`] on transport failures.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError>;

    /// Deletes a record. Returns `false` if the key did not exist.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Lists all live records whose key starts with `prefix`.
    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError>;

    /// Removes expired records. Returns how many were removed.
    ///
    /// Best-effort: backends with native expiry return 0. Correctness never
    /// depends on it because reads already hide expired records.
    async fn cleanup_expired(&self) -> Result<usize, StorageError>;
}

/// Constructs a storage key from a namespace and correlation identifier.
///
/// # Examples
///
/// ```
/// use taskbridge::store::backend::make_key;
///
/// assert_eq!(make_key("task", "abc-123"), "task:abc-123");
/// ```
pub fn make_key(namespace: &str, correlation_id: &str) -> String {
    format!("{namespace}:{correlation_id}")
}

/// Splits a storage key into `(namespace, correlation_id)` on the first colon.
///
/// # Examples
///
/// ```
/// use taskbridge::store::backend::parse_key;
///
/// assert_eq!(parse_key("task:abc"), Some(("task", "abc")));
/// assert_eq!(parse_key("bare"), None);
/// ```
pub fn parse_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

/// Constructs the listing prefix for a namespace: `{namespace}:`.
pub fn make_prefix(namespace: &str) -> String {
    format!("{namespace}:")
}
