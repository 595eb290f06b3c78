//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` fmt subscriber from [`LoggingConfig`]. Installation is
//! best-effort: if the host application already set a global subscriber, that one wins.

use crate::config::LoggingConfig;
use tracing::info;

/// Install the global subscriber described by `config`.
///
/// Returns `true` when this call installed it.
pub fn init(config: &LoggingConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        info!(app = %config.app_name, level = %config.log_level, "logging initialized");
    }
    installed
}

/// Subscriber for tests, writing through the test harness capture
pub fn init_for_tests() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}
