//! Tracing subscriber setup for applications and tests.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a global subscriber: a `fmt` layer filtered by `RUST_LOG`, or by
/// `default_directive` (e.g. `"floe_rpc=info"`) when `RUST_LOG` is unset.
///
/// Returns false when a global subscriber was already installed, so calling
/// it from every test is harmless.
pub fn try_init_logging(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(filter)
        .try_init()
        .is_ok()
}
