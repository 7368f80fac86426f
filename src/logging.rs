//! Tracing subscriber setup for the `cardsync` binary.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "CARDSYNC_LOG";

const LOG_FILE_PREFIX: &str = "cardsync.log";

/// Filter directive for a configured level. `verbose` wins over the file.
pub fn default_directive(level: &str, verbose: bool) -> String {
    let level = if verbose { "debug" } else { level };
    format!("cardsync={}", level)
}

fn build_filter(directive: &str) -> Result<EnvFilter> {
    match std::env::var(LOG_ENV) {
        Ok(value) if !value.is_empty() => EnvFilter::try_new(&value)
            .with_context(|| format!("Invalid {}: '{}'", LOG_ENV, value)),
        _ => EnvFilter::try_new(directive)
            .with_context(|| format!("Invalid log level directive: '{}'", directive)),
    }
}

/// Install the global subscriber. Logs go to stderr; when `file_dir` is set
/// they are also written to a daily-rotated file through a non-blocking
/// writer, whose guard must be held until exit.
pub fn init(
    config: &LoggingConfig,
    format: LogFormat,
    verbose: bool,
    file_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(&default_directive(&config.level, verbose))?;

    let stderr_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = match file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive("info", false), "cardsync=info");
        assert_eq!(default_directive("warn", true), "cardsync=debug");
    }

    #[test]
    fn test_directive_parses_as_filter() {
        assert!(EnvFilter::try_new(default_directive("trace", false)).is_ok());
    }
}
