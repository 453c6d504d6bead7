//! Asynchronous task-correlation bridge.
//!
//! A request/response front-end submits work to a decoupled worker pool
//! through a message bus and later reunites the worker's result with the
//! original request by correlation identifier. A shared task store holds the
//! only authoritative state.
//!
//! # Overview
//!
//! ```text
//! front-end -> Correlator::submit -> TaskStore (Pending) + MessageBus::publish(work)
//!           -> WorkerLoop claims (Pending -> Processing) -> Compute
//!           -> TaskStore (Completed | Failed) -> Correlator::await_result
//! ```
//!
//! The bus is at-least-once; exactly-once effect comes from the store's
//! compare-and-set on the `Pending -> Processing` claim, so any number of
//! duplicate deliveries run the compute step at most once per claim. The
//! [`Reaper`](reaper::Reaper) recovers claims left behind by crashed workers.
//!
//! # Module Organization
//!
//! - [`domain`] - Task records, status machine, versioned payloads
//! - [`store`] - Task store trait, generic CAS implementation, backends
//! - [`bus`] - Message bus trait, consumer-group stream, backends
//! - [`worker`] - The claim/compute/record loop
//! - [`correlator`] - Submission and bounded waiting
//! - [`reaper`] - Stale claim recovery and expiry cleanup
//! - [`compute`] - The external compute collaborator
//! - [`frontend`] - Chat session adapter
//! - [`config`] - Layered TOML/environment configuration
//!
//! # Features
//!
//! - `redis` (default): Redis task store and Redis Streams bus
//! - `http-compute` (default): HTTP compute collaborator
//! - `logging` (default): `tracing-subscriber` setup used by the binary
//! - `redis-tests`: integration tests against a live Redis

pub mod bus;
pub mod compute;
pub mod config;
pub mod correlator;
pub mod domain;
pub mod error;
pub mod frontend;
#[cfg(feature = "logging")]
pub mod logging;
pub mod reaper;
pub mod retry;
pub mod store;
pub mod worker;

pub use bus::{BusError, MessageBus, TaskEvent};
pub use compute::{Compute, ComputeError};
pub use config::{BridgeConfig, ConfigError};
pub use correlator::{AwaitOutcome, Correlator, CorrelatorConfig, CorrelatorError, SubmitError};
pub use domain::{Payload, PayloadSchema, TaskRecord, TaskStatus, TaskUpdate};
pub use error::TaskError;
pub use reaper::{ReapReport, Reaper, ReaperConfig};
pub use store::{GenericTaskStore, InMemoryBackend, StoreConfig, TaskStore};
pub use worker::{ProcessOutcome, WorkerConfig, WorkerLoop};
