//! Structured logging setup.
//!
//! The graph passes emit `tracing` events; this module installs a global
//! `tracing-subscriber` to print them.
//!
//! ```no_run
//! use opgraph_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default().with_format(LogFormat::Json))
//!     .expect("Failed to initialize logging");
//! tracing::info!(operators = 12, "compiling graph");
//! ```

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{SessionError, SessionResult};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format with colors (for development).
    #[default]
    Pretty,
    /// Compact format without colors.
    Compact,
    /// JSON format (for log aggregation).
    Json,
}

/// Log level filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-pass topo sort progress and arena traffic.
    Trace,
    /// Every applied rewrite and shape update.
    Debug,
    /// One event per completed phase.
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// How to install the global subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Used when neither `env_filter` nor `RUST_LOG` is set.
    pub level: LogLevel,
    /// Explicit filter directives, e.g. `opgraph_ir=debug`; overrides `RUST_LOG`.
    pub env_filter: Option<String>,
    pub with_targets: bool,
    pub with_file_location: bool,
    pub with_thread_ids: bool,
    /// Log span open/close, which includes the compile span timings.
    pub with_span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: LogLevel::Info,
            env_filter: None,
            with_targets: true,
            with_file_location: false,
            with_thread_ids: false,
            with_span_events: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    pub fn with_targets(mut self, enabled: bool) -> Self {
        self.with_targets = enabled;
        self
    }

    pub fn with_file_location(mut self, enabled: bool) -> Self {
        self.with_file_location = enabled;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Compact output without targets.
    pub fn production() -> Self {
        Self::default()
            .with_format(LogFormat::Compact)
            .with_targets(false)
    }

    /// Pretty output at debug level with source locations.
    pub fn development() -> Self {
        Self::default()
            .with_level(LogLevel::Debug)
            .with_file_location(true)
    }

    fn filter(&self) -> SessionResult<EnvFilter> {
        match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives)
                .map_err(|e| SessionError::Logging(format!("invalid env filter: {}", e))),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))),
        }
    }
}

/// Installs the global subscriber described by `config`.
///
/// Only one global subscriber can exist per process; later calls fail with
/// [`SessionError::Logging`].
pub fn init_logging(config: &LoggingConfig) -> SessionResult<()> {
    let env_filter = config.filter()?;
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(config.with_targets)
                    .with_file(config.with_file_location)
                    .with_line_number(config.with_file_location)
                    .with_thread_ids(config.with_thread_ids)
                    .with_span_events(span_events)
                    .pretty(),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_target(config.with_targets)
                    .with_file(config.with_file_location)
                    .with_line_number(config.with_file_location)
                    .with_thread_ids(config.with_thread_ids)
                    .with_span_events(span_events)
                    .with_ansi(false)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_target(config.with_targets)
                    .with_file(config.with_file_location)
                    .with_line_number(config.with_file_location)
                    .with_thread_ids(config.with_thread_ids)
                    .with_span_events(span_events)
                    .json(),
            )
            .try_init(),
    };
    result.map_err(|e| SessionError::Logging(format!("failed to initialize tracing: {}", e)))
}
