//! Logging setup.
//!
//! Console logging through `tracing_subscriber` with an environment
//! filter; the `log` macros used throughout the library are bridged into
//! the same subscriber.

use tracing_subscriber::EnvFilter;

/// Initialize console logging. `verbose` lowers the default level to
/// debug; `RUST_LOG` overrides either default.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
