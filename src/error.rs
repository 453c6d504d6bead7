//! Error types for task store operations.
//!
//! [`TaskError`] is what the store hands back to the worker loop, the
//! correlator and the reaper. Use [`is_transient`](TaskError::is_transient)
//! to decide whether an operation is worth retrying with backoff.

use std::fmt;

use crate::domain::TaskStatus;

/// Errors that can occur during task store operations.
///
/// # Examples
///
/// ```
/// use taskbridge::{TaskError, TaskStatus};
///
/// let err = TaskError::Conflict {
///     correlation_id: "abc".to_string(),
///     expected: TaskStatus::Pending,
///     actual: TaskStatus::Processing,
/// };
/// assert!(!err.is_transient());
/// assert!(err.to_string().contains("abc"));
/// ```
#[derive(Debug)]
pub enum TaskError {
    /// A live record already exists for this correlation identifier.
    AlreadyExists {
        /// The colliding identifier.
        correlation_id: String,
    },

    /// No live record exists (never created, deleted, or expired).
    NotFound {
        /// The missing identifier.
        correlation_id: String,
    },

    /// The stored status did not match the status the caller expected.
    Conflict {
        /// The task being transitioned.
        correlation_id: String,
        /// The status the caller expected.
        expected: TaskStatus,
        /// The status actually stored.
        actual: TaskStatus,
    },

    /// The requested status change is not in the transition table.
    InvalidTransition {
        /// The task being transitioned.
        correlation_id: String,
        /// Current status.
        from: TaskStatus,
        /// Rejected target status.
        to: TaskStatus,
    },

    /// Optimistic retries were exhausted by concurrent writers.
    Contended {
        /// The contended task.
        correlation_id: String,
        /// How many CAS rounds were attempted.
        attempts: u32,
    },

    /// The stored bytes could not be decoded as a task record.
    Corrupt {
        /// The affected task.
        correlation_id: String,
        /// Decoder message.
        message: String,
    },

    /// Transport-level failure talking to the backing store.
    TransientStore(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists { correlation_id } => {
                write!(f, "task already exists: {correlation_id}")
            },
            Self::NotFound { correlation_id } => write!(f, "task not found: {correlation_id}"),
            Self::Conflict {
                correlation_id,
                expected,
                actual,
            } => write!(
                f,
                "status conflict for task {correlation_id}: expected {expected}, found {actual}"
            ),
            Self::InvalidTransition {
                correlation_id,
                from,
                to,
            } => write!(
                f,
                "invalid transition from {from} to {to} for task {correlation_id}"
            ),
            Self::Contended {
                correlation_id,
                attempts,
            } => write!(
                f,
                "task {correlation_id} still contended after {attempts} attempts"
            ),
            Self::Corrupt {
                correlation_id,
                message,
            } => write!(f, "corrupt record for task {correlation_id}: {message}"),
            Self::TransientStore(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl std::error::Error for TaskError {}

impl TaskError {
    /// Returns `true` for failures a caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_) | Self::Contended { .. })
    }

    /// Returns the correlation identifier the error refers to, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::AlreadyExists { correlation_id }
            | Self::NotFound { correlation_id }
            | Self::Conflict { correlation_id, .. }
            | Self::InvalidTransition { correlation_id, .. }
            | Self::Contended { correlation_id, .. }
            | Self::Corrupt { correlation_id, .. } => Some(correlation_id),
            Self::TransientStore(_) => None,
        }
    }
}
