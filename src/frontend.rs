//! Line-oriented chat front-end.
//!
//! A [`ChatSession`] turns one incoming chat message into exactly one
//! outgoing [`Reply`]. Birth dates written `YYYY-MM-DD` or `YYYY/MM/DD` are
//! normalised, submitted through the [`Correlator`] as a `birth-date@v1`
//! payload, and answered with the result, the failure reason, or a
//! "still working" notice carrying the correlation id to check later.

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::NaiveDate;
use regex::Regex;

use crate::correlator::{AwaitOutcome, Correlator, CorrelatorError};
use crate::domain::{Payload, PayloadSchema};
use crate::error::TaskError;

/// Schema name of submitted birth dates.
pub const BIRTH_DATE_SCHEMA: &str = "birth-date";

/// Schema version of submitted birth dates.
pub const BIRTH_DATE_VERSION: u32 = 1;

static DATE_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}[-/]\d{2}[-/]\d{2}$").expect("date shape pattern is valid")
});

/// The schema workers should accept for chat submissions.
pub fn birth_date_schema() -> PayloadSchema {
    PayloadSchema::new(BIRTH_DATE_SCHEMA, BIRTH_DATE_VERSION)
}

/// Returns `true` if `input` is written like a date, valid or not.
pub fn looks_like_date(input: &str) -> bool {
    DATE_SHAPE.is_match(input.trim())
}

/// Parses a calendar date written `YYYY-MM-DD` or `YYYY/MM/DD`.
///
/// # Examples
///
/// ```
/// use taskbridge::frontend::parse_birth_date;
///
/// assert_eq!(parse_birth_date("1990/05/12").unwrap().to_string(), "1990-05-12");
/// assert!(parse_birth_date("1990-02-30").is_none());
/// ```
pub fn parse_birth_date(input: &str) -> Option<NaiveDate> {
    let input = input.trim();
    if !looks_like_date(input) {
        return None;
    }
    NaiveDate::parse_from_str(&input.replace('/', "-"), "%Y-%m-%d").ok()
}

/// What a chat message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// `/start`
    Start,
    /// `/cancel`
    Cancel,
    /// A valid birth date.
    BirthDate(NaiveDate),
    /// Shaped like a date but not a real one.
    InvalidDate,
    /// Anything else.
    Other,
}

/// Classifies one chat message.
pub fn interpret(message: &str) -> Intent {
    let message = message.trim();
    match message {
        "/start" => Intent::Start,
        "/cancel" => Intent::Cancel,
        _ if looks_like_date(message) => {
            parse_birth_date(message).map_or(Intent::InvalidDate, Intent::BirthDate)
        },
        _ => Intent::Other,
    }
}

/// One message back to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Greeting with input instructions.
    Welcome,
    /// Reminder of the expected input.
    Prompt,
    /// The date could not be understood.
    InvalidDate,
    /// Conversation closed.
    Goodbye,
    /// The task completed.
    Result(String),
    /// The task failed, or could not be submitted.
    Failure(String),
    /// No outcome yet; the task keeps running.
    StillWorking {
        /// Id to check on later.
        correlation_id: String,
    },
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Welcome => write!(
                f,
                "Welcome! Send me your date of birth in one of these formats:\n\
                 - YYYY-MM-DD (e.g., 1990-05-23)\n\
                 - YYYY/MM/DD (e.g., 1990/05/23)"
            ),
            Self::Prompt => write!(
                f,
                "Please send me your date of birth in YYYY-MM-DD format.\n\
                 Example: 1990-05-23 or 1990/05/23"
            ),
            Self::InvalidDate => write!(
                f,
                "I couldn't understand that as a date. Please use YYYY-MM-DD or YYYY/MM/DD format.\n\
                 Example: 1990-05-23 or 1990/05/23"
            ),
            Self::Goodbye => write!(f, "Okay! Send /start any time to begin again."),
            Self::Result(text) => write!(
                f,
                "{text}\n\nWould you like another reading? Just send me another date!"
            ),
            Self::Failure(reason) => write!(
                f,
                "Sorry, I couldn't generate your reading ({reason}). Please try again."
            ),
            Self::StillWorking { correlation_id } => write!(
                f,
                "Still working on it. Check back later with reference {correlation_id}."
            ),
        }
    }
}

/// A chat conversation backed by a correlator.
#[derive(Debug, Clone)]
pub struct ChatSession {
    correlator: Arc<Correlator>,
    wait: Duration,
}

impl ChatSession {
    /// Creates a session that waits up to `wait` for each reading.
    pub fn new(correlator: Arc<Correlator>, wait: Duration) -> Self {
        Self { correlator, wait }
    }

    /// Answers one chat message.
    pub async fn handle_message(&self, message: &str) -> Reply {
        match interpret(message) {
            Intent::Start => Reply::Welcome,
            Intent::Cancel => Reply::Goodbye,
            Intent::InvalidDate => Reply::InvalidDate,
            Intent::Other => Reply::Prompt,
            Intent::BirthDate(date) => self.request_reading(date).await,
        }
    }

    /// Submits `date` and waits for the outcome.
    #[tracing::instrument(skip(self), fields(date = %date))]
    pub async fn request_reading(&self, date: NaiveDate) -> Reply {
        let payload = Payload::new(
            BIRTH_DATE_SCHEMA,
            BIRTH_DATE_VERSION,
            date.format("%Y-%m-%d").to_string(),
        );
        match self.correlator.submit_and_wait(payload, Some(self.wait)).await {
            Ok((correlation_id, outcome)) => render(correlation_id, outcome),
            Err(e) => {
                tracing::error!(error = %e, "reading request failed");
                Reply::Failure(e.to_string())
            },
        }
    }

    /// Looks at a task again without waiting.
    pub async fn check(&self, correlation_id: &str) -> Reply {
        match self
            .correlator
            .await_result(correlation_id, Duration::ZERO)
            .await
        {
            Ok(outcome) => render(correlation_id.to_string(), outcome),
            Err(CorrelatorError::Store(TaskError::NotFound { .. })) => {
                Reply::Failure("that request has expired".to_string())
            },
            Err(e) => Reply::Failure(e.to_string()),
        }
    }
}

fn render(correlation_id: String, outcome: AwaitOutcome) -> Reply {
    match outcome {
        AwaitOutcome::Completed(result) => Reply::Result(result.body),
        AwaitOutcome::Failed(reason) => Reply::Failure(reason),
        AwaitOutcome::TimedOut => Reply::StillWorking { correlation_id },
    }
}
