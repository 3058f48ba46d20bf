//! Configuration Loading System
//!
//! Provides configuration loading from multiple sources, later sources
//! overriding earlier ones:
//! 1. Default values
//! 2. Environment variables
//! 3. Configuration files or in-memory TOML

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration source type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Load from a file
    File(PathBuf),
    /// Load from environment variables
    Env,
    /// Use default values
    Default,
    /// Load from in-memory string
    Memory(String),
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(ConfigError::InvalidValue {
                field: "log.level".to_string(),
                message: format!("Invalid log level: {s}"),
            }),
        }
    }
}

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    #[default]
    Json,
    /// Pretty format
    Pretty,
    /// Compact format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            _ => Err(ConfigError::InvalidValue {
                field: "log.format".to_string(),
                message: format!("Invalid log format: {s}"),
            }),
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Output to stdout
    #[default]
    Stdout,
    /// Output to stderr
    Stderr,
    /// Output to file
    File,
    /// Output to both stdout and file
    Both,
}

impl std::str::FromStr for LogOutput {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "file" => Ok(Self::File),
            "both" => Ok(Self::Both),
            _ => Err(ConfigError::InvalidValue {
                field: "log.output".to_string(),
                message: format!("Invalid log output: {s}"),
            }),
        }
    }
}

/// Simulated clock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Simulated seconds elapsing per wall-clock second
    pub acceleration: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            acceleration: 1000.0,
        }
    }
}

/// Admission controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum number of concurrently deployed applications, 0 for unlimited
    pub max_applications: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_applications: 64,
        }
    }
}

/// One admissible frequency and its throughput
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyLevelConfig {
    /// Frequency in MHz
    pub frequency: u32,
    /// Instructions per simulated second at this frequency
    pub instructions_per_second: f64,
}

/// A group of identical computers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputerGroupConfig {
    /// Number of computers in the group
    pub count: usize,
    /// Processors per computer
    pub processors: usize,
    /// Cores per processor
    pub cores_per_processor: usize,
    /// Frequency every core starts at, in MHz
    pub default_frequency: u32,
    /// Maximum allowed gap between two cores of a processor, in MHz
    pub max_frequency_gap: u32,
    /// Admissible frequencies
    pub levels: Vec<FrequencyLevelConfig>,
}

impl ComputerGroupConfig {
    /// Total cores contributed by the group, `None` on overflow
    #[must_use]
    pub fn total_cores(&self) -> Option<usize> {
        self.count
            .checked_mul(self.processors)?
            .checked_mul(self.cores_per_processor)
    }
}

impl Default for ComputerGroupConfig {
    fn default() -> Self {
        Self {
            count: 1,
            processors: 1,
            cores_per_processor: 2,
            default_frequency: 1500,
            max_frequency_gap: 1500,
            levels: vec![
                FrequencyLevelConfig {
                    frequency: 1500,
                    instructions_per_second: 1.5e6,
                },
                FrequencyLevelConfig {
                    frequency: 3000,
                    instructions_per_second: 3.0e6,
                },
            ],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Log output
    pub output: LogOutput,
    /// File path for file output
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            file_path: None,
        }
    }
}

/// Top-level fabric configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Simulated clock
    pub clock: ClockConfig,
    /// Admission controller
    pub admission: AdmissionConfig,
    /// Computer pool, in allocation scan order
    pub computers: Vec<ComputerGroupConfig>,
    /// Logging
    pub log: LogConfig,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            clock: ClockConfig::default(),
            admission: AdmissionConfig::default(),
            computers: vec![ComputerGroupConfig::default()],
            log: LogConfig::default(),
        }
    }
}

impl FabricConfig {
    /// Total cores over every computer group, `None` on overflow
    #[must_use]
    pub fn total_cores(&self) -> Option<usize> {
        self.computers
            .iter()
            .try_fold(0usize, |total, group| total.checked_add(group.total_cores()?))
    }
}

/// Configuration loader
#[derive(Debug)]
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: vec![ConfigSource::Default],
            env_prefix: None,
        }
    }

    /// Add a file source
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.sources
            .push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add an in-memory TOML source
    pub fn with_str(mut self, content: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Memory(content.into()));
        self
    }

    /// Add environment variable source with prefix
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.sources.push(ConfigSource::Env);
        self
    }

    /// Load configuration from all sources
    pub fn load(&self) -> Result<FabricConfig> {
        let mut config = FabricConfig::default();

        for source in &self.sources {
            match source {
                ConfigSource::Default => {}
                ConfigSource::File(path) => {
                    let content = std::fs::read_to_string(path)?;
                    config = Self::parse(&content)?;
                }
                ConfigSource::Env => {
                    if let Some(prefix) = &self.env_prefix {
                        config = Self::apply_env_overrides(config, prefix)?;
                    }
                }
                ConfigSource::Memory(content) => {
                    config = Self::parse(content)?;
                }
            }
        }

        Self::expand_paths(&mut config);
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn load_from_str(toml: &str) -> Result<FabricConfig> {
        let mut config = Self::parse(toml)?;
        Self::expand_paths(&mut config);
        Ok(config)
    }

    /// Get default configuration
    #[must_use]
    pub fn default_config() -> FabricConfig {
        FabricConfig::default()
    }

    fn parse(content: &str) -> Result<FabricConfig> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn expand_paths(config: &mut FabricConfig) {
        if let Some(ref path) = config.log.file_path {
            config.log.file_path = Some(Self::expand_path(path));
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: FabricConfig, prefix: &str) -> Result<FabricConfig> {
        if let Ok(val) = std::env::var(format!("{prefix}_CLOCK_ACCELERATION")) {
            config.clock.acceleration = val
                .parse()
                .map_err(|_| ConfigError::EnvVar(format!("Invalid acceleration value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_ADMISSION_MAX_APPLICATIONS")) {
            config.admission.max_applications = val.parse().map_err(|_| {
                ConfigError::EnvVar(format!("Invalid max_applications value: {val}"))
            })?;
        }

        if let Ok(val) = std::env::var(format!("{prefix}_LOG_LEVEL")) {
            config.log.level = val.parse()?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_FORMAT")) {
            config.log.format = val.parse()?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_OUTPUT")) {
            config.log.output = val.parse()?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_FILE_PATH")) {
            config.log.file_path = Some(PathBuf::from(val));
        }

        Ok(config)
    }

    /// Expand path with tilde
    fn expand_path(path: &Path) -> PathBuf {
        if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        path.to_path_buf()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // Tests touching the environment use a unique variable prefix each, so
    // parallel tests never observe each other's overrides.

    #[test]
    fn test_log_enums_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());

        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());

        assert_eq!("both".parse::<LogOutput>().unwrap(), LogOutput::Both);
        assert!("syslog".parse::<LogOutput>().is_err());
    }

    #[test]
    fn test_fabric_config_default() {
        let config = FabricConfig::default();
        assert_eq!(config.clock.acceleration, 1000.0);
        assert_eq!(config.admission.max_applications, 64);
        assert_eq!(config.computers.len(), 1);
        assert_eq!(config.total_cores(), Some(2));
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn test_config_loader_sources() {
        let loader = ConfigLoader::new()
            .with_file("/etc/fabric.toml")
            .with_env_prefix("FABRIC");
        assert_eq!(loader.sources.len(), 3);
        assert_eq!(loader.sources[0], ConfigSource::Default);
        assert_eq!(loader.env_prefix, Some("FABRIC".to_string()));
    }

    #[test]
    fn test_load_from_str_full() {
        let toml = r#"
            [clock]
            acceleration = 250.0

            [admission]
            max_applications = 0

            [[computers]]
            count = 3
            processors = 2
            cores_per_processor = 4
            default_frequency = 1500
            max_frequency_gap = 500
            levels = [
                { frequency = 1500, instructions_per_second = 1.5e6 },
                { frequency = 2000, instructions_per_second = 2.0e6 },
            ]

            [[computers]]
            count = 1
            processors = 1
            cores_per_processor = 2

            [log]
            level = "debug"
            format = "pretty"
            output = "stderr"
        "#;
        let config = ConfigLoader::load_from_str(toml).unwrap();
        assert_eq!(config.clock.acceleration, 250.0);
        assert_eq!(config.admission.max_applications, 0);
        assert_eq!(config.computers.len(), 2);
        assert_eq!(config.computers[0].levels.len(), 2);
        assert_eq!(config.computers[0].total_cores(), Some(24));
        // Omitted group fields fall back to the defaults
        assert_eq!(config.computers[1].default_frequency, 1500);
        assert_eq!(config.total_cores(), Some(26));
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.log.output, LogOutput::Stderr);
    }

    #[test]
    fn test_load_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let toml = r#"
            [clock]
            acceleration = 10.0
        "#;
        temp_file.write_all(toml.as_bytes()).unwrap();

        let config = ConfigLoader::new().with_file(temp_file.path()).load().unwrap();
        assert_eq!(config.clock.acceleration, 10.0);
    }

    #[test]
    fn test_load_missing_file_and_bad_toml() {
        assert!(
            ConfigLoader::new()
                .with_file("/nonexistent/fabric.toml")
                .load()
                .is_err()
        );
        assert!(matches!(
            ConfigLoader::load_from_str("invalid toml {{"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        unsafe {
            std::env::set_var("FABENV_CLOCK_ACCELERATION", "42.5");
            std::env::set_var("FABENV_ADMISSION_MAX_APPLICATIONS", "3");
            std::env::set_var("FABENV_LOG_LEVEL", "error");
            std::env::set_var("FABENV_LOG_OUTPUT", "file");
            std::env::set_var("FABENV_LOG_FILE_PATH", "/tmp/fabric.log");
        }
        let config = ConfigLoader::new().with_env_prefix("FABENV").load().unwrap();
        assert_eq!(config.clock.acceleration, 42.5);
        assert_eq!(config.admission.max_applications, 3);
        assert_eq!(config.log.level, LogLevel::Error);
        assert_eq!(config.log.output, LogOutput::File);
        assert_eq!(config.log.file_path, Some(PathBuf::from("/tmp/fabric.log")));
        unsafe {
            std::env::remove_var("FABENV_CLOCK_ACCELERATION");
            std::env::remove_var("FABENV_ADMISSION_MAX_APPLICATIONS");
            std::env::remove_var("FABENV_LOG_LEVEL");
            std::env::remove_var("FABENV_LOG_OUTPUT");
            std::env::remove_var("FABENV_LOG_FILE_PATH");
        }
    }

    #[test]
    fn test_env_override_invalid_number() {
        unsafe {
            std::env::set_var("FABBAD_CLOCK_ACCELERATION", "fast");
        }
        let result = ConfigLoader::new().with_env_prefix("FABBAD").load();
        assert!(matches!(result, Err(ConfigError::EnvVar(_))));
        unsafe {
            std::env::remove_var("FABBAD_CLOCK_ACCELERATION");
        }
    }

    #[test]
    fn test_memory_source_overrides_env() {
        unsafe {
            std::env::set_var("FABMEM_CLOCK_ACCELERATION", "5.0");
        }
        let config = ConfigLoader::new()
            .with_env_prefix("FABMEM")
            .with_str("[clock]\nacceleration = 7.0\n")
            .load()
            .unwrap();
        assert_eq!(config.clock.acceleration, 7.0);
        unsafe {
            std::env::remove_var("FABMEM_CLOCK_ACCELERATION");
        }
    }

    #[test]
    fn test_path_expansion() {
        let expanded = ConfigLoader::expand_path(Path::new("~/logs/fabric.log"));
        assert!(!expanded.to_string_lossy().contains('~'));

        let absolute = PathBuf::from("/var/log/fabric.log");
        assert_eq!(ConfigLoader::expand_path(&absolute), absolute);
    }

    #[test]
    fn test_toml_serialization_roundtrip() {
        let config = FabricConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: FabricConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }
}
