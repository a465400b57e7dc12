//! Logging bootstrap.
//!
//! The embedding shell owns log routing (files, panes); the engine only
//! installs a sensible default subscriber when asked.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "rust_dlm=info,process_utils=warn";

/// Initialize the global subscriber: `RUST_LOG` when set, the default
/// filter otherwise. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
