//! Tracing initialisation.
//!
//! Sets up a single `tracing-subscriber` fmt layer in one of three formats:
//! - `pretty`: multi-line with colors, for a terminal on the bench
//! - `compact`: one line per event without colors, for a headless logger
//! - `json`: for log aggregation
//!
//! `RUST_LOG` overrides the configured level when set. Log output goes to
//! stderr so the operator prompt on stdout stays readable.
//!
//! # Example
//! ```no_run
//! use shock_logger::{config::LoggerConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoggerConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(channels = config.acquisition.channels.len(), "Logger configured");
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggerConfig;
use crate::error::{AppResult, LoggerError};

/// Output format for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Pretty,
    Compact,
    Json,
}

impl FromStr for OutputFormat {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(LoggerError::Configuration(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    pub format: OutputFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Colors (pretty format only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Build from the `[application]` section.
    pub fn from_logger_config(config: &LoggerConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialise tracing from the logger configuration.
pub fn init_from_config(config: &LoggerConfig) -> AppResult<()> {
    init(TracingConfig::from_logger_config(config)?)
}

/// Initialise tracing.
///
/// Calling this more than once is not an error; later calls leave the first
/// subscriber in place.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_target(false);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(LoggerError::Configuration(format!(
                    "Failed to initialize tracing: {e}"
                )))
            }
        })
}

fn parse_log_level(level: &str) -> AppResult<Level> {
    Level::from_str(level).map_err(|_| {
        LoggerError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))
    })
}
