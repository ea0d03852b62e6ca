//! Unified logging module for the sniffer service
//!
//! Console output plus an optional daily rolling log file, both in the
//! `timestamp [LEVEL] message` format.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable overriding the configured log directory
pub const LOG_DIR_ENV: &str = "QUATTSRV_LOG_DIR";

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2026-03-02T00:50:44.809123Z [INFO] Listening on 0.0.0.0:8899`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking file writer alive for the process lifetime
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Resolve the log directory
///
/// Priority: `QUATTSRV_LOG_DIR` env > `configured` > "logs"
pub fn resolve_log_dir(configured: Option<&Path>) -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            configured
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("logs"))
        })
}

/// Daily files kept before the oldest is deleted
const DEFAULT_MAX_LOG_FILES: usize = 14;

/// Daily rolling file `{service}.{YYYY-MM-DD}.log` in `log_dir`
fn daily_file_appender(config: &LogConfig) -> Result<RollingFileAppender, Box<dyn std::error::Error>> {
    fs::create_dir_all(&config.log_dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&config.service_name)
        .filename_suffix("log")
        .max_log_files(config.max_log_files)
        .build(&config.log_dir)?;
    Ok(appender)
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used for the file name and the default filter
    pub service_name: String,
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Filter directive used when RUST_LOG is unset (e.g. "info" or "info,rtu_sniffer=debug")
    pub level: String,
    /// Write a daily rolling log file next to the console output
    pub enable_file: bool,
    /// JSON lines in the log file instead of the bracketed format
    pub enable_json: bool,
    /// Daily files kept on disk
    pub max_log_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "quattsrv".to_string(),
            log_dir: PathBuf::from("logs"),
            level: "info".to_string(),
            enable_file: false,
            enable_json: false,
            max_log_files: DEFAULT_MAX_LOG_FILES,
        }
    }
}

/// Logging section of a service configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, overridden by RUST_LOG
    pub level: String,
    /// Log file directory, overridden by QUATTSRV_LOG_DIR
    pub dir: Option<PathBuf>,
    pub file: bool,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file: false,
            json: false,
        }
    }
}

/// Filter directive: RUST_LOG wins over the configured level
fn filter_directive(config: &LogConfig) -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone())
}

/// Initialize the global subscriber
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let directive = filter_directive(&config);
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| format!("Invalid log level '{}': {}", directive, e))?;

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.enable_file {
        let (non_blocking, guard) = tracing_appender::non_blocking(daily_file_appender(&config)?);
        if GUARD.set(guard).is_err() {
            return Err("Logging already initialized".into());
        }

        let layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_level(true)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if config.enable_file {
        tracing::info!("Logging: {} @ {:?} ({})", config.service_name, config.log_dir, directive);
    } else {
        tracing::info!("Logging: {} console only ({})", config.service_name, directive);
    }

    Ok(())
}
