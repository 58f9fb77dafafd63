//! Logging - structured tracing for the bridge
//!
//! Design: every component logs through the macros re-exported here with an
//! `event` field naming the operation, so output can be filtered per
//! subsystem. The global subscriber is installed once per process; later
//! calls are no-ops. File output rotates daily through a non-blocking
//! writer whose guard lives for the rest of the process.

pub use tracing::{debug, error, info, instrument, trace, warn, Level};

use once_cell::sync::OnceCell;
use std::env;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

static INIT: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, multi-line
    Pretty,
    /// One line per event
    Compact,
    /// Structured JSON
    Json,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Daily-rotated file under `directory`
    File { directory: String, prefix: String },
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Emit span open/close events
    pub span_events: bool,
    /// Extra filter directives, e.g. "shadowbridge::store=trace"
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `SHADOWBRIDGE_LOG_*` variables over the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level) = env::var("SHADOWBRIDGE_LOG_LEVEL") {
            if let Some(level) = parse_level(&level) {
                config.level = level;
            }
        }
        if let Ok(path) = env::var("SHADOWBRIDGE_LOG_FILE") {
            config.output = file_output(&path);
        }
        if env_flag("SHADOWBRIDGE_LOG_JSON") {
            config.format = LogFormat::Json;
        }
        if env_flag("SHADOWBRIDGE_LOG_SPANS") {
            config.span_events = true;
        }
        if let Ok(filter) = env::var("SHADOWBRIDGE_LOG_FILTER") {
            config.filter = Some(filter);
        }
        config
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Level names as accepted in the environment and config files
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

pub fn parse_format(name: &str) -> Option<LogFormat> {
    match name.trim().to_ascii_lowercase().as_str() {
        "pretty" => Some(LogFormat::Pretty),
        "compact" => Some(LogFormat::Compact),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}

/// Split `dir/name.log` into a rolling-file destination
pub fn file_output(path: &str) -> LogOutput {
    let path = std::path::Path::new(path);
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    let prefix = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "shadowbridge.log".to_string());
    LogOutput::File { directory, prefix }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Install the subscriber from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Install the subscriber; only the first call in a process has effect
pub fn init_with_config(config: LogConfig) {
    INIT.get_or_init(|| install(config));
}

pub fn is_initialized() -> bool {
    INIT.get().is_some()
}

fn install(config: LogConfig) -> Option<WorkerGuard> {
    let filter = build_filter(&config);
    let spans = span_events_config(config.span_events);

    let (writer, guard) = match &config.output {
        LogOutput::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        LogOutput::Stderr => tracing_appender::non_blocking(std::io::stderr()),
        LogOutput::File { directory, prefix } => {
            tracing_appender::non_blocking(rolling::daily(directory, prefix))
        }
    };

    // try_init: a host application may already own the global subscriber
    let installed = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .pretty()
                    .with_span_events(spans)
                    .with_filter(filter),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .compact()
                    .with_span_events(spans)
                    .with_filter(filter),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .with_span_events(spans)
                    .with_filter(filter),
            )
            .try_init(),
    };

    match installed {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let base = EnvFilter::default().add_directive(config.level.into());
    match &config.filter {
        Some(directives) => directives
            .split(',')
            .filter(|d| !d.trim().is_empty())
            .fold(base, |filter, directive| match directive.trim().parse() {
                Ok(directive) => filter.add_directive(directive),
                Err(_) => filter,
            }),
        None => base,
    }
}

fn span_events_config(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = LogConfig::new()
            .with_level(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_span_events(true)
            .with_filter("shadowbridge::store=trace");

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.span_events);
        assert_eq!(config.filter.as_deref(), Some("shadowbridge::store=trace"));
    }

    #[test]
    fn test_parse_level_and_format() {
        assert_eq!(parse_level("TRACE"), Some(Level::TRACE));
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
        assert_eq!(parse_format("json"), Some(LogFormat::Json));
        assert_eq!(parse_format("xml"), None);
    }

    #[test]
    fn test_file_output_split() {
        assert_eq!(
            file_output("/var/log/bridge.log"),
            LogOutput::File {
                directory: "/var/log".to_string(),
                prefix: "bridge.log".to_string(),
            }
        );
        assert_eq!(
            file_output("bridge.log"),
            LogOutput::File {
                directory: ".".to_string(),
                prefix: "bridge.log".to_string(),
            }
        );
    }

    #[test]
    fn test_bad_filter_directives_are_skipped() {
        let config = LogConfig::new().with_filter("shadowbridge=debug,,shadowbridge::store=loud");
        let filter = build_filter(&config);
        assert!(filter.to_string().contains("shadowbridge=debug"));
    }

    #[test]
    fn test_init_idempotent() {
        init_with_config(LogConfig::default());
        init_with_config(LogConfig::default().with_level(Level::TRACE));
        assert!(is_initialized());
    }
}
