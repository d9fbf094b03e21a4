//! Logging infrastructure for Conduit.
//!
//! [`init`] installs one global `tracing` subscriber writing to stderr and,
//! optionally, to an append-only file. Settings come from the same
//! [`EnvSource`] the rest of the configuration uses.

use conduit_common_config::{vars, EnvSource, Environment, ProcessEnv};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan, writer::MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Target used for echoed SQL statements.
///
/// Filter on it (`RUST_LOG=conduit::sql=info`) to see statement traffic
/// without the rest of the database layer's debug output.
pub const SQL_TARGET: &str = "conduit::sql";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Used when `RUST_LOG` holds no filter directives.
    pub level: LogLevel,
    pub format: LogFormat,
    /// Also append to this file, without ANSI colours.
    pub file_path: Option<PathBuf>,
    pub timestamps: bool,
    pub source_location: bool,
    /// Emit span open/close events.
    pub span_events: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl LogLevel {
    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event, for log shippers.
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            file_path: None,
            timestamps: true,
            source_location: false,
            span_events: false,
        }
    }
}

impl LogConfig {
    /// Read the `CONDUIT_LOG_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_source(&ProcessEnv)
    }

    /// Read the `CONDUIT_LOG_*` variables from `source`.
    ///
    /// `CONDUIT_LOG_LEVEL` falls back to a bare level in `RUST_LOG`.
    /// Unrecognised values keep the default; logging is never a reason
    /// to refuse to start.
    pub fn from_source<S: EnvSource + ?Sized>(source: &S) -> Self {
        let env = Environment::new(source);
        let mut config = Self::default();

        if let Some(level) = env
            .get(vars::CONDUIT_LOG_LEVEL)
            .or_else(|| env.get(vars::RUST_LOG))
            .and_then(|v| LogLevel::parse(&v))
        {
            config.level = level;
        }
        if let Some(format) = env
            .get(vars::CONDUIT_LOG_FORMAT)
            .and_then(|v| LogFormat::parse(&v))
        {
            config.format = format;
        }
        config.file_path = env.get(vars::CONDUIT_LOG_FILE).map(PathBuf::from);

        let flag = |var, default| env.get_bool(var).ok().flatten().unwrap_or(default);
        config.timestamps = flag(vars::CONDUIT_LOG_TIMESTAMPS, config.timestamps);
        config.source_location = flag(vars::CONDUIT_LOG_SOURCE, config.source_location);
        config.span_events = flag(vars::CONDUIT_LOG_SPANS, config.span_events);

        config
    }

    fn fmt_span(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .with_file(self.source_location)
            .with_line_number(self.source_location)
            .with_span_events(self.fmt_span());

        match (self.format, self.timestamps) {
            (LogFormat::Pretty, true) => layer.pretty().boxed(),
            (LogFormat::Pretty, false) => layer.pretty().without_time().boxed(),
            (LogFormat::Compact, true) => layer.compact().boxed(),
            (LogFormat::Compact, false) => layer.compact().without_time().boxed(),
            (LogFormat::Json, true) => layer.json().boxed(),
            (LogFormat::Json, false) => layer.json().without_time().boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` directives take precedence over `config.level` when present.
/// Fails if a subscriber is already installed.
pub fn init(config: LogConfig) -> Result<(), LogError> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(config.level).into())
        .from_env_lossy();

    let mut layers = vec![config.layer(io::stderr, true)];
    if let Some(path) = &config.file_path {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        layers.push(config.layer(Arc::new(file), false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LogError::InitError(e.to_string()))
}

/// Logging errors.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to initialize logging: {0}")]
    InitError(String),

    #[error("failed to open log file: {0}")]
    FileError(#[from] io::Error),
}

/// Convenience macros re-exported from tracing.
pub use tracing::{debug, error, info, trace, warn};

/// Span helpers for the database layer.
pub mod spans;

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_common_config::MapEnv;

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("Warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse(" error "), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("conduit=debug"), None);
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
    }

    #[test]
    fn test_defaults_from_empty_source() {
        let config = LogConfig::from_source(&MapEnv::new());

        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file_path.is_none());
        assert!(config.timestamps);
        assert!(!config.source_location);
        assert!(!config.span_events);
    }

    #[test]
    fn test_config_from_source() {
        let env = MapEnv::new()
            .with(vars::CONDUIT_LOG_LEVEL, "debug")
            .with(vars::CONDUIT_LOG_FORMAT, "JSON")
            .with(vars::CONDUIT_LOG_FILE, "/var/log/conduit/api.log")
            .with(vars::CONDUIT_LOG_SOURCE, "true")
            .with(vars::CONDUIT_LOG_SPANS, "1")
            .with(vars::CONDUIT_LOG_TIMESTAMPS, "off");

        let config = LogConfig::from_source(&env);
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(
            config.file_path,
            Some(PathBuf::from("/var/log/conduit/api.log"))
        );
        assert!(config.source_location);
        assert!(config.span_events);
        assert!(!config.timestamps);
    }

    #[test]
    fn test_rust_log_fallback() {
        let env = MapEnv::new().with(vars::RUST_LOG, "warn");
        assert_eq!(LogConfig::from_source(&env).level, LogLevel::Warn);

        // Directive lists are left to EnvFilter.
        let env = MapEnv::new().with(vars::RUST_LOG, "conduit::sql=info");
        assert_eq!(LogConfig::from_source(&env).level, LogLevel::Info);

        let env = env.with(vars::CONDUIT_LOG_LEVEL, "error");
        assert_eq!(LogConfig::from_source(&env).level, LogLevel::Error);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let env = MapEnv::new()
            .with(vars::CONDUIT_LOG_FORMAT, "xml")
            .with(vars::CONDUIT_LOG_SPANS, "maybe");

        let config = LogConfig::from_source(&env);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(!config.span_events);
    }
}
