//! Logging initialization (§10.2): an `EnvFilter` + stdout `fmt` layer set up
//! once at process start, defaulting to `info` for this binary's own crates
//! and `warn` for everything else, plus a daily-rolling file layer so a
//! headless/long-running process keeps a record after the terminal is gone.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str =
    "twitch_capture=info,stream_tracker=info,twitch_api=info,tracker_core=info,warn";

/// Installs the global `tracing` subscriber. `override_level`, when set,
/// replaces the whole filter directive (e.g. from `--log-level debug`)
/// rather than layering on top of [`DEFAULT_LOG_FILTER`].
///
/// Returns the file-appender's [`WorkerGuard`]; the caller must hold onto it
/// for the lifetime of the process, since dropping it stops flushing
/// buffered log lines to disk.
pub fn init(override_level: Option<&str>) -> WorkerGuard {
    let directive = override_level.unwrap_or(DEFAULT_LOG_FILTER);
    let filter = || EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let file_appender = tracing_appender::rolling::daily(Path::new("./logs"), "twitch-capture.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    guard
}
