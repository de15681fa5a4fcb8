//! Logging setup shared by the Cadence binaries
//!
//! Supports text, JSON and pretty-printed output. `RUST_LOG` wins over the
//! configured level when set, so per-module filters such as
//! `RUST_LOG=libcadence::scheduler=debug` work as usual.
//!
//! # Examples
//!
//! ```no_run
//! use libcadence::logging::{LogFormat, LoggingConfig};
//!
//! // JSON lines for the daemon
//! LoggingConfig::new(LogFormat::Json, "info".to_string(), false).init();
//! ```

use std::str::FromStr;

/// Environment variable selecting the output format
pub const LOG_FORMAT_ENV: &str = "CADENCE_LOG_FORMAT";
/// Environment variable selecting the minimum level
pub const LOG_LEVEL_ENV: &str = "CADENCE_LOG_LEVEL";

// sqlx logs every statement at info; the sweep issues a lot of them
const QUIET_DEPENDENCIES: &str = "sqlx=warn,hyper=warn,reqwest=warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable text output (no colors, for piping)
    Text,
    /// One JSON object per line
    Json,
    /// Pretty-printed with colors (for development)
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    pub verbose: bool,
}

impl LoggingConfig {
    /// * `format` - Log output format (text, json, or pretty)
    /// * `level` - Minimum log level (error, warn, info, debug, trace)
    /// * `verbose` - Forces debug level regardless of `level`
    pub fn new(format: LogFormat, level: String, verbose: bool) -> Self {
        Self {
            format,
            level,
            verbose,
        }
    }

    /// Build from `CADENCE_LOG_FORMAT` / `CADENCE_LOG_LEVEL`, falling back
    /// to text at `default_level`
    pub fn from_env(default_level: &str, verbose: bool) -> Self {
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Text);
        let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());

        Self::new(format, level, verbose)
    }

    /// The filter directive used when `RUST_LOG` is unset
    pub fn directive(&self) -> String {
        let level: &str = if self.verbose { "debug" } else { &self.level };
        format!("{},{}", level, QUIET_DEPENDENCIES)
    }

    /// Install the global subscriber
    ///
    /// Returns `false` if a subscriber was already installed (e.g. by a
    /// previous call in the same test binary).
    pub fn init(&self) -> bool {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.directive()));

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(true)
                .flatten_event(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .with_file(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true)
                .try_init(),
        };

        result.is_ok()
    }
}

/// Initialize logging from the environment at info level
pub fn init_default() -> bool {
    LoggingConfig::from_env("info", false).init()
}
