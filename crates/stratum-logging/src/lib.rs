//! Stratum Logging
//!
//! One place to install the `tracing` subscriber. The filter is read from
//! `RUST_LOG` and falls back to [`DEFAULT_FILTER`].

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "stratum=info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

/// Install the global subscriber, failing if one is already set.
pub fn try_init() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer())
        .try_init()
}

/// Install the global subscriber.
///
/// # Panics
///
/// Panics if a global subscriber has already been installed.
pub fn init() {
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer())
        .init();
}

/// Subscriber for tests: output goes through the test harness capture and
/// repeated calls are ignored.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_test_writer())
        .try_init();
}
