//! Logging setup.
//!
//! Log records always go to stderr: stdout of the `publish` subcommand is a
//! line-oriented channel read by whoever launched the process.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{PerfError, PerfResult};

// ----------------------------------------------------------------------------
// Log levels
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Parse from string, falling back to `Info` for anything unrecognised
    pub fn parse_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

// ----------------------------------------------------------------------------
// Subscriber initialization
// ----------------------------------------------------------------------------

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> PerfResult<()> {
    let level = LogLevel::parse_lossy(&config.level);
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level.to_tracing_level()).into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            registry.with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            ),
        ),
        "pretty" => tracing::subscriber::set_global_default(
            registry.with(
                fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
        _ => tracing::subscriber::set_global_default(
            registry.with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            ),
        ),
    };
    result.map_err(|e| PerfError::Internal(format!("Failed to set logger: {e}")))?;

    info!(
        target: "loadgauge::init",
        level = %level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::parse_lossy("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::parse_lossy("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse_lossy("bogus"), LogLevel::Info);
        assert_eq!(LogLevel::Error.to_string(), "error");
        assert!(LogLevel::Trace < LogLevel::Error);
    }
}
