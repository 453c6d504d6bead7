//! Task lifecycle status and its transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Lifecycle status of a correlated task.
///
/// # State Machine
///
/// ```text
/// Pending    -> Processing, Failed
/// Processing -> Completed, Failed
/// Completed  -> (terminal, no transitions)
/// Failed     -> (terminal, no transitions)
/// ```
///
/// `Processing -> Pending` is deliberately absent. Only the reaper's
/// `reclaim` operation may move a stale claim back, and it does so through
/// its own compare-and-set path.
///
/// # Examples
///
/// ```
/// use taskbridge::TaskStatus;
///
/// assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Processing));
/// assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::Processing));
/// assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::Pending));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created by the correlator, waiting for a worker to claim it.
    Pending,
    /// Claimed by exactly one worker; compute is in flight.
    Processing,
    /// Compute succeeded and the result is stored (terminal).
    Completed,
    /// Compute failed, timed out, or the task was abandoned (terminal).
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl TaskStatus {
    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns `true` if moving from this status to `next` is allowed.
    ///
    /// Self-transitions are rejected.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Processing | Self::Failed),
            Self::Processing => matches!(next, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }

    /// Validates a transition, returning [`TaskError::InvalidTransition`]
    /// when the table above does not allow it.
    pub fn validate_transition(&self, correlation_id: &str, next: &Self) -> Result<(), TaskError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                correlation_id: correlation_id.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}
