//! Logging init: structured events to stderr.

use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` when set and valid, else `fallback`
pub fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global stderr subscriber. Later calls are no-ops.
pub fn init_logging(fallback_filter: &str) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter(fallback_filter))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(filter = fallback_filter, "logging initialized");
    }
}
