//! Tracing infrastructure.
//!
//! Structured, async-aware logging built on `tracing` and `tracing-subscriber`:
//! - Multiple output formats (pretty, compact, JSON)
//! - `RUST_LOG` overrides the configured level
//! - Integration with [`HubConfig`]
//!
//! # Example
//! ```no_run
//! use rov_hub::{config::HubConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HubConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("Hub started");
//! # Ok(())
//! # }
//! ```

use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored output for bench work.
    Pretty,
    /// Single-line output for the vehicle's console.
    #[default]
    Compact,
    /// JSON lines for log collection.
    Json,
}

/// Logging options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Maximum level to emit.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Whether to include file and line numbers.
    pub with_file_and_line: bool,
    /// Whether to include thread names.
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (ignored for JSON).
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Create a config with the given level and default options.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Derive logging options from the hub configuration.
    pub fn from_hub_config(config: &HubConfig) -> HubResult<Self> {
        let settings = &config.logging;
        Ok(Self::new(parse_log_level(&settings.level)?)
            .with_format(settings.format)
            .with_ansi(settings.ansi)
            .with_file_and_line(settings.file_and_line))
    }

    /// Set output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Enable or disable file and line numbers.
    pub fn with_file_and_line(mut self, enabled: bool) -> Self {
        self.with_file_and_line = enabled;
        self
    }
}

/// Initialize logging from the hub configuration.
pub fn init_from_config(config: &HubConfig) -> HubResult<()> {
    init(&LoggingConfig::from_hub_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`.
pub fn init(config: &LoggingConfig) -> HubResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Tests and embedding binaries may have installed one already
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(HubError::Configuration(format!(
            "Failed to initialize tracing: {e}"
        ))),
    }
}

/// Parse a log level name (case-insensitive).
pub fn parse_log_level(level: &str) -> HubResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(HubError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_logging_config_from_hub() {
        let mut hub = HubConfig::default();
        hub.logging.level = "debug".into();
        hub.logging.format = LogFormat::Json;
        hub.logging.ansi = false;
        hub.logging.file_and_line = true;

        let config = LoggingConfig::from_hub_config(&hub).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.with_ansi);
        assert!(config.with_file_and_line);
        assert!(config.with_thread_names);
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new(Level::WARN)
            .with_format(LogFormat::Pretty)
            .with_ansi(false)
            .with_file_and_line(true);

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(!config.with_ansi);
        assert!(config.with_file_and_line);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::new(Level::ERROR).with_ansi(false);
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }
}
