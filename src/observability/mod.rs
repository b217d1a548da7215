use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Install the global tracing subscriber for the already-normalized config
/// level. [`LogLevel::Disabled`] installs nothing, so the binary can run
/// silent without a subscriber in the hot path.
pub fn init_tracing(level: LogLevel) {
    let directive = match level {
        LogLevel::Disabled => return,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Warning => tracing::Level::WARN,
        LogLevel::Error => tracing::Level::ERROR,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::default().add_directive(directive.into()))
        .with_target(true)
        .init();
}
