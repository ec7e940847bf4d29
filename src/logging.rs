//! Tracing subscriber setup for the binary.
//!
//! Components never configure logging themselves; they emit through
//! whatever subscriber is installed, inside the spans they are given.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

use crate::config::LogConfig;

/// Dependencies that are far too chatty at trace level.
const QUIET_TARGETS: &[&str] = &["tungstenite", "tokio_tungstenite", "rustls", "mio"];

/// Filter directives used when `RUST_LOG` is not set.
pub fn default_directives(config: &LogConfig) -> String {
    if config.trace {
        let mut directives = vec!["trace".to_string()];
        directives.extend(QUIET_TARGETS.iter().map(|t| format!("{t}=info")));
        directives.join(",")
    } else if config.debug {
        "debug".to_string()
    } else {
        "info".to_string()
    }
}

/// Install the global subscriber.
///
/// Logs go to stderr, and additionally to a daily-rolling file when a log
/// directory is configured. The returned guard must be held for the life
/// of the process so buffered file output is flushed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>, TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config)));

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "act-runner.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(config.debug || config.trace)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}
