//! Tracing setup for applications embedding settle.
//!
//! Library code only emits `tracing` events; nothing is printed unless the
//! host installs a subscriber. This helper installs a reasonable one.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a stderr subscriber filtered by `RUST_LOG`, defaulting to `warn`.
///
/// Returns `false` if a global subscriber was already installed.
///
/// # Example
/// ```bash
/// RUST_LOG=settle_reconciler=debug cargo run
/// ```
pub fn init() -> bool {
    init_with_default("warn")
}

/// As [`init`], with an explicit fallback directive when `RUST_LOG` is unset.
pub fn init_with_default(directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .is_ok()
}
