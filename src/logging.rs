//! Subscriber setup for binaries.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the process. [`init_logging`] is what the `taskbridge` binary uses.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// With `json` set, events are written as one JSON object per line. Calling
/// this more than once is harmless; later calls leave the first subscriber
/// in place.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
