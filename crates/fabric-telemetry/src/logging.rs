//! Structured Logging with Tracing

use crate::{Result, TelemetryError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log levels compatible with tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace-level logging for very verbose output
    Trace,
    /// Debug-level logging, per-task events
    Debug,
    /// Info-level logging, component lifecycle
    Info,
    /// Warn-level logging, rejected operations
    Warn,
    /// Error-level logging, dropped work and invariant violations
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    #[must_use]
    pub const fn to_tracing_level(&self) -> Level {
        match self {
            Self::Trace => Level::TRACE,
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warn => Level::WARN,
            Self::Error => Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

impl FromStr for LogLevel {
    type Err = TelemetryError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(TelemetryError::Logging(format!("Invalid log level: {s}"))),
        }
    }
}

impl From<fabric_config::LogLevel> for LogLevel {
    fn from(level: fabric_config::LogLevel) -> Self {
        match level {
            fabric_config::LogLevel::Trace => Self::Trace,
            fabric_config::LogLevel::Debug => Self::Debug,
            fabric_config::LogLevel::Info => Self::Info,
            fabric_config::LogLevel::Warn => Self::Warn,
            fabric_config::LogLevel::Error => Self::Error,
        }
    }
}

/// Output format for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// JSON formatted output
    Json,
    /// Human-readable pretty format with colors
    Pretty,
    /// Compact format with minimal spacing
    Compact,
}

impl From<fabric_config::LogFormat> for LogFormat {
    fn from(format: fabric_config::LogFormat) -> Self {
        match format {
            fabric_config::LogFormat::Json => Self::Json,
            fabric_config::LogFormat::Pretty => Self::Pretty,
            fabric_config::LogFormat::Compact => Self::Compact,
        }
    }
}

/// Output destination for logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOutput {
    /// Write logs to standard output
    Stdout,
    /// Write logs to standard error
    Stderr,
    /// Write logs to a file at the specified path
    File(PathBuf),
    /// Write logs to both standard output and a file
    Both {
        /// Whether to write to stdout
        stdout: bool,
        /// File path for log output
        file: PathBuf,
    },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Format for log output
    pub format: LogFormat,
    /// Destination for log output
    pub output: LogOutput,
    /// Whether to include the target module path in logs
    pub include_target: bool,
    /// Whether to include file name and line number in logs
    pub include_file_line: bool,
    /// Whether to include thread ID in logs
    pub include_thread_id: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            output: LogOutput::Stdout,
            include_target: true,
            include_file_line: false,
            include_thread_id: false,
        }
    }
}

impl TryFrom<&fabric_config::LogConfig> for LogConfig {
    type Error = TelemetryError;

    fn try_from(config: &fabric_config::LogConfig) -> Result<Self> {
        let file = || {
            config.file_path.clone().ok_or_else(|| {
                TelemetryError::Init("log file output selected without a file path".to_string())
            })
        };
        let output = match config.output {
            fabric_config::LogOutput::Stdout => LogOutput::Stdout,
            fabric_config::LogOutput::Stderr => LogOutput::Stderr,
            fabric_config::LogOutput::File => LogOutput::File(file()?),
            fabric_config::LogOutput::Both => LogOutput::Both {
                stdout: true,
                file: file()?,
            },
        };
        Ok(Self {
            level: config.level.into(),
            format: config.format.into(),
            output,
            ..Self::default()
        })
    }
}

/// Initialize global logging with the given configuration
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
///
/// # Errors
///
/// Returns an error if a subscriber is already installed or the log file
/// cannot be opened.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    match &config.output {
        LogOutput::Stdout => apply_fmt(config, std::io::stdout, filter),
        LogOutput::Stderr => apply_fmt(config, std::io::stderr, filter),
        LogOutput::File(path) => {
            let writer = SharedWriter::new(false, open_log_file(path)?);
            apply_fmt(config, writer, filter)
        }
        LogOutput::Both { stdout, file } => {
            let writer = SharedWriter::new(*stdout, open_log_file(file)?);
            apply_fmt(config, writer, filter)
        }
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}

/// Log file writer, optionally teeing to stdout
#[derive(Clone)]
struct SharedWriter {
    stdout: Option<Arc<Mutex<std::io::Stdout>>>,
    file: Arc<Mutex<File>>,
}

impl SharedWriter {
    fn new(stdout: bool, file: File) -> Self {
        Self {
            stdout: stdout.then(|| Arc::new(Mutex::new(std::io::stdout()))),
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(stdout) = &self.stdout {
            stdout.lock().write_all(buf)?;
        }
        self.file.lock().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(stdout) = &self.stdout {
            stdout.lock().flush()?;
        }
        self.file.lock().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedWriter {
    type Writer = Self;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn apply_fmt<W>(config: &LogConfig, writer: W, filter: EnvFilter) -> Result<()>
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let init_result = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_writer(writer)
            .with_target(config.include_target)
            .with_file(config.include_file_line)
            .with_line_number(config.include_file_line)
            .with_thread_ids(config.include_thread_id)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_writer(writer)
            .with_target(config.include_target)
            .with_file(config.include_file_line)
            .with_line_number(config.include_file_line)
            .with_thread_ids(config.include_thread_id)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .compact()
            .with_writer(writer)
            .with_target(config.include_target)
            .with_file(config.include_file_line)
            .with_line_number(config.include_file_line)
            .with_thread_ids(config.include_thread_id)
            .with_env_filter(filter)
            .try_init(),
    };
    init_result.map_err(|e| TelemetryError::Init(format!("Failed to init subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing_and_display() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Debug.to_string(), "debug");
        assert_eq!(LogLevel::Error.to_tracing_level(), Level::ERROR);
        assert!("chatty".parse::<LogLevel>().is_err());
        assert!(LogLevel::Trace < LogLevel::Error);
    }

    #[test]
    fn test_conversion_from_file_config() {
        let file_config = fabric_config::LogConfig {
            level: fabric_config::LogLevel::Debug,
            format: fabric_config::LogFormat::Compact,
            output: fabric_config::LogOutput::Both,
            file_path: Some(PathBuf::from("/var/log/fabric.log")),
        };
        let config = LogConfig::try_from(&file_config).unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(
            config.output,
            LogOutput::Both {
                stdout: true,
                file: PathBuf::from("/var/log/fabric.log"),
            }
        );
        assert!(config.include_target);
    }

    #[test]
    fn test_conversion_requires_file_path() {
        let file_config = fabric_config::LogConfig {
            output: fabric_config::LogOutput::File,
            ..fabric_config::LogConfig::default()
        };
        assert!(matches!(
            LogConfig::try_from(&file_config),
            Err(TelemetryError::Init(_))
        ));
    }

    #[test]
    fn test_config_serializes() {
        let json = serde_json::to_string(&LogConfig::default()).unwrap();
        assert!(json.contains("Pretty"));
    }

    #[test]
    fn test_init_logging_to_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fabric.log");
        let config = LogConfig {
            level: LogLevel::Info,
            format: LogFormat::Json,
            output: LogOutput::File(path.clone()),
            ..LogConfig::default()
        };

        init_logging(&config).unwrap();
        tracing::info!(component = "test", "hello from the fabric");
        assert!(path.exists());

        // A second global subscriber is refused
        assert!(matches!(
            init_logging(&config),
            Err(TelemetryError::Init(_))
        ));
    }
}
