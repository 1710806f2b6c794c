//! Logging Bootstrap
//!
//! Small helper for embedding hosts that do not bring their own
//! subscriber. Filtering follows `RUST_LOG`.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the default subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
