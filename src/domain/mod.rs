//! Domain types shared by the store, the bus and both sides of the bridge.

pub mod payload;
pub mod record;
pub mod status;

pub use payload::{Payload, PayloadSchema, TEXT_SCHEMA};
pub use record::{TaskRecord, TaskUpdate};
pub use status::TaskStatus;
