//! Task record -- the store's representation of a correlated task.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::Payload;
use super::status::TaskStatus;

/// The single source of truth for a correlated task.
///
/// Only the correlator creates records and only workers (and the reaper)
/// mutate them. The `result` field is set iff the status is `Completed`;
/// `error` is set iff the status is `Failed`. [`TaskUpdate`] carries the
/// result or error together with the target status so the store cannot be
/// asked for anything else.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskbridge::{Payload, TaskRecord, TaskStatus};
///
/// let record = TaskRecord::new(
///     "corr-1".to_string(),
///     Payload::text("1990-05-12"),
///     Some(Duration::from_secs(300)),
/// );
/// assert_eq!(record.status, TaskStatus::Pending);
/// assert!(record.result.is_none());
/// assert!(record.error.is_none());
/// assert!(record.expires_at.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Correlation identifier linking the request to its result.
    pub correlation_id: String,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Input supplied by the submitting front-end.
    pub payload: Payload,

    /// Compute output, present only when `status` is `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,

    /// Diagnostic, present only when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// How many times the reaper has reclaimed a stale claim.
    #[serde(default)]
    pub attempts: u32,

    /// When the correlator created the record.
    pub created_at: DateTime<Utc>,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,

    /// Absolute expiry. `None` means the record never expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Backend CAS version of the stored copy. Not part of the stored body.
    #[serde(skip)]
    pub version: u64,
}

/// A status change together with the data the target status requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskUpdate {
    /// Claim the task for processing.
    Processing,
    /// Finish successfully with a result.
    Completed(Payload),
    /// Finish with a diagnostic.
    Failed(String),
}

impl TaskUpdate {
    /// The status this update moves the task into.
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Processing => TaskStatus::Processing,
            Self::Completed(_) => TaskStatus::Completed,
            Self::Failed(_) => TaskStatus::Failed,
        }
    }
}

/// Computes `now + ttl`, treating overflow as "never expires".
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl?;
    let delta = chrono::Duration::from_std(ttl).ok()?;
    now.checked_add_signed(delta)
}

impl TaskRecord {
    /// Creates a `Pending` record expiring `ttl` from now.
    pub fn new(correlation_id: String, payload: Payload, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            status: TaskStatus::Pending,
            payload,
            result: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            expires_at: expiry_after(now, ttl),
            version: 0,
        }
    }

    /// Returns `true` once `expires_at` has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expiry| Utc::now() >= expiry)
    }

    /// Applies an already-validated update.
    ///
    /// When the update is terminal and `terminal_ttl` is set, the expiry is
    /// pulled in to `now + terminal_ttl` (never pushed out past the current
    /// expiry).
    pub(crate) fn apply(&mut self, update: TaskUpdate, terminal_ttl: Option<Duration>) {
        let now = Utc::now();
        self.status = update.status();
        match update {
            TaskUpdate::Processing => {},
            TaskUpdate::Completed(result) => {
                self.result = Some(result);
                self.error = None;
            },
            TaskUpdate::Failed(error) => {
                self.error = Some(error);
                self.result = None;
            },
        }
        if self.status.is_terminal() {
            if let Some(terminal_expiry) = expiry_after(now, terminal_ttl) {
                self.expires_at = Some(match self.expires_at {
                    Some(current) if current < terminal_expiry => current,
                    _ => terminal_expiry,
                });
            }
        }
        self.updated_at = now;
    }
}
