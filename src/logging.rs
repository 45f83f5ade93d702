//! Structured logging setup on top of `tracing`.
//!
//! The `LITPROF_LOG` environment variable takes precedence over the configured level and accepts
//! any `EnvFilter` directive string (for example `litprof::dispatch=debug,info`).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable overriding the configured filter.
pub const LOG_ENV: &str = "LITPROF_LOG";

/// Logging initialisation errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The filter directive could not be parsed.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Unknown output format.
    #[error("invalid log format: {0} (must be 'text' or 'json')")]
    Format(String),
    /// A global subscriber is already installed.
    #[error("logging already initialised: {0}")]
    AlreadyInitialised(String),
}

/// The `logging` section of the profile document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level or filter directives: trace, debug, info, warn, error, off.
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format: text or json.
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LoggingError::Filter(e.to_string()))
}

/// Install the global subscriber. Logs go to stderr so stdout stays free for reports.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(config)?;
    let registry = Registry::default().with(filter);

    match config.format.as_str() {
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialised(e.to_string())),
        "text" => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialised(e.to_string())),
        other => Err(LoggingError::Format(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_logging_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "text");
    }

    #[test]
    fn unknown_format_is_rejected() {
        let config = LoggingConfig {
            level: "info".to_string(),
            format: "xml".to_string(),
        };
        assert!(matches!(
            init_logging(&config),
            Err(LoggingError::Format(f)) if f == "xml"
        ));
    }
}
