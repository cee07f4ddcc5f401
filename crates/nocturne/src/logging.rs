//! Logging initialization for nocturne.
//!
//! The level is controlled through `RUST_LOG`:
//!
//! ```bash
//! # Per-connection accept/close and parsed request lines
//! RUST_LOG=nocturne=trace nocturne 8080
//!
//! # Only rejections and failures
//! RUST_LOG=warn nocturne 8080
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging from `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_names(true)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

/// Initialize logging with an explicit level, ignoring `RUST_LOG`.
///
/// ```rust,no_run
/// nocturne::logging::init_logging_with_level("debug");
/// ```
pub fn init_logging_with_level(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init();
}
