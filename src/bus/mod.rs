//! Message bus abstraction: topics, consumer groups, leased deliveries.
//!
//! The bus carries [`TaskEvent`] signals between the correlator and the
//! workers. It is at-least-once and unordered: a delivery that is neither
//! acknowledged nor negatively acknowledged before its lease runs out is
//! handed to another consumer of the same group, which is how a crashed
//! worker's events get recovered. Consumers therefore have to tolerate
//! duplicates; the task store's compare-and-set is what makes processing
//! effectively once.
//!
//! Events are signals only. The authoritative state of a task always lives
//! in the [`TaskStore`](crate::store::TaskStore).
//!
//! # Backends
//!
//! - [`InMemoryBus`](memory::InMemoryBus) -- single process, used by tests
//!   and the `chat` command.
//! - [`RedisStreamBus`](redis::RedisStreamBus) -- Redis Streams with
//!   consumer groups. Available behind the `redis` feature flag.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::InMemoryBus;

use crate::domain::{Payload, TaskStatus};

/// Errors raised by [`MessageBus`] implementations.
#[derive(Error, Debug)]
pub enum BusError {
    /// The event could not be handed to the transport.
    #[error("failed to publish to topic '{topic}': {message}")]
    TransientPublish {
        /// Target topic.
        topic: String,
        /// Transport diagnostic.
        message: String,
    },

    /// Reading, acknowledging or requeueing failed at the transport.
    #[error("failed to consume from topic '{topic}': {message}")]
    TransientConsume {
        /// Source topic.
        topic: String,
        /// Transport diagnostic.
        message: String,
    },

    /// An event could not be encoded or decoded.
    #[error("malformed event: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl BusError {
    /// Returns `true` for transport failures worth retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Encoding(_))
    }
}

/// What an event asks of its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A task is ready to be processed.
    Work,
    /// A task reached a terminal status.
    Completion {
        /// The terminal status.
        status: TaskStatus,
    },
}

/// A signal on the bus, JSON-encoded on the wire.
///
/// # Examples
///
/// ```
/// use taskbridge::bus::{EventKind, TaskEvent};
/// use taskbridge::Payload;
///
/// let event = TaskEvent::work("corr-1", Payload::text("1990-05-12"));
/// let bytes = event.encode().unwrap();
/// let back = TaskEvent::decode(&bytes).unwrap();
/// assert_eq!(back.kind, EventKind::Work);
/// assert_eq!(back.correlation_id, "corr-1");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    /// The task this event refers to.
    pub correlation_id: String,
    /// Event kind.
    pub kind: EventKind,
    /// Input for work events, result (if any) for completion events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// When the event was emitted.
    pub emitted_at: DateTime<Utc>,
}

impl TaskEvent {
    /// Creates a work event carrying the task input.
    pub fn work(correlation_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind: EventKind::Work,
            payload: Some(payload),
            emitted_at: Utc::now(),
        }
    }

    /// Creates a completion event for a terminal task.
    pub fn completion(
        correlation_id: impl Into<String>,
        status: TaskStatus,
        result: Option<Payload>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind: EventKind::Completion { status },
            payload: result,
            emitted_at: Utc::now(),
        }
    }

    /// Encodes the event as JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes an event from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One leased hand-over of an event to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Topic the event was read from.
    pub topic: String,
    /// Consumer group holding the lease.
    pub group: String,
    /// Transport-specific message identifier, used for ack/nack.
    pub delivery_id: String,
    /// The decoded event.
    pub event: TaskEvent,
    /// How many times this message has been handed out, including this one.
    /// Backends that cannot track it exactly report a lower bound.
    pub delivery_count: u32,
}

/// Where and how a consumer reads.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Topic to read.
    pub topic: String,
    /// Consumer group; members of one group share the topic's events.
    pub group: String,
    /// This consumer's name within the group.
    pub consumer: String,
    /// Maximum deliveries per receive call.
    pub batch_size: usize,
    /// How long a receive call may wait for events before returning empty.
    pub wait: Duration,
    /// Visibility timeout: unacknowledged deliveries are redelivered after it.
    pub lease: Duration,
}

impl Subscription {
    /// Creates a subscription with a batch of 16, a 2 s wait and a 30 s lease.
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            consumer: consumer.into(),
            batch_size: 16,
            wait: Duration::from_secs(2),
            lease: Duration::from_secs(30),
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the receive wait.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Sets the lease (visibility timeout).
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// Publish/consume interface over an event-stream transport.
///
/// Implementations must be `Send + Sync`; one bus is shared by every worker
/// task in the process.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Appends an event to `topic`. Returns the transport's message id.
    ///
    /// # Errors
    ///
    /// [`BusError::TransientPublish`] on transport failure. The event may or
    /// may not have been stored.
    async fn publish(&self, topic: &str, event: &TaskEvent) -> Result<String, BusError>;

    /// Leases up to `batch_size` deliveries, waiting at most
    /// `subscription.wait` for at least one. Returns an empty batch on
    /// timeout.
    ///
    /// Lease-expired and nacked deliveries are served before new ones.
    async fn receive(&self, subscription: &Subscription) -> Result<Vec<Delivery>, BusError>;

    /// Confirms a delivery so it is never redelivered. Idempotent.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Releases a delivery for immediate redelivery to the group.
    async fn nack(&self, delivery: &Delivery) -> Result<(), BusError>;
}

struct ConsumeState {
    bus: Arc<dyn MessageBus>,
    subscription: Subscription,
    buffered: VecDeque<Delivery>,
}

/// Turns a subscription into a lazy, endless stream of deliveries.
///
/// Transport errors are yielded as items and the stream keeps going, so a
/// consumer decides for itself whether to back off. Dropping the stream and
/// calling `consume` again with the same group resumes where the group left
/// off; deliveries leased but not acknowledged come back after their lease.
pub fn consume(
    bus: Arc<dyn MessageBus>,
    subscription: Subscription,
) -> BoxStream<'static, Result<Delivery, BusError>> {
    let state = ConsumeState {
        bus,
        subscription,
        buffered: VecDeque::new(),
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delivery) = state.buffered.pop_front() {
                return Some((Ok(delivery), state));
            }
            match state.bus.receive(&state.subscription).await {
                Ok(batch) => state.buffered.extend(batch),
                Err(e) => return Some((Err(e), state)),
            }
        }
    }))
}
