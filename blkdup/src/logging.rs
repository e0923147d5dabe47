//! Logging initialization for the CLI.
//!
//! The core library only emits `tracing` events; this module decides where
//! they go. Logs always go to stderr so that stdout stays clean for `list`
//! output and JSON reports.

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Configuration for the logging system.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogConfig {
    /// Output logs as JSON lines.
    pub json: bool,
    /// Raise the default level to DEBUG.
    pub verbose: bool,
}

/// Builds the filter from `directives` (the value of `RUST_LOG`, if any).
/// Without valid directives both crates log at the level implied by
/// `verbose`.
fn env_filter(directives: Option<&str>, verbose: bool) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| {
            let level = if verbose { Level::DEBUG } else { Level::INFO };
            let level = level.as_str().to_lowercase();
            EnvFilter::new(format!("blkdup={level},blkdup_core={level}"))
        })
}

/// Installs the global subscriber. Call once, early in `main`.
pub fn init(config: LogConfig) {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = env_filter(directives.as_deref(), config.verbose);

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(config.verbose)
                    .compact(),
            )
            .init();
    }
}
