//! Configuration validation for the compute fabric

use crate::config::{
    AdmissionConfig, ClockConfig, ComputerGroupConfig, FabricConfig, LogConfig, LogOutput,
};
use crate::{ConfigError, Result};
use std::collections::HashSet;
use std::fmt;

/// Core count above which a fabric is flagged as very large
const LARGE_FABRIC_CORES: usize = 100_000;

/// Result of configuration validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Errors that prevent the configuration from being used
    pub errors: Vec<ValidationError>,
    /// Non-blocking warnings about potential configuration issues
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    /// Creates a new empty validation result
    #[must_use]
    pub const fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Returns true if there are no validation errors
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns true if there are any warnings present
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Adds a validation error to the result
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Adds a validation warning to the result
    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Merges another validation result into this one
    pub fn merge(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Turn the errors, if any, into a single [`ConfigError::Validation`]
    pub fn into_result(self) -> Result<Vec<ValidationWarning>> {
        if self.errors.is_empty() {
            return Ok(self.warnings);
        }
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(ConfigError::Validation(joined))
    }
}

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The configuration field that failed validation
    pub field: String,
    /// Human-readable error message
    pub message: String,
    /// Error classification code
    pub code: ErrorCode,
}

impl ValidationError {
    /// Creates a new validation error
    pub fn new(field: impl Into<String>, message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.code, self.field, self.message)
    }
}

/// Validation warning details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    /// The configuration field that triggered the warning
    pub field: String,
    /// Human-readable warning message
    pub message: String,
    /// Optional suggestion for resolving the warning
    pub suggestion: Option<String>,
}

impl ValidationWarning {
    /// Creates a new validation warning without a suggestion
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Creates a new validation warning with a suggestion for resolution
    pub fn with_suggestion(
        field: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[WARNING] {}: {}", self.field, self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (Suggestion: {s})")?;
        }
        Ok(())
    }
}

/// Error code classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A required field is missing or empty
    Required,
    /// A value is outside the acceptable range
    OutOfRange,
    /// A specified path does not exist
    PathNotFound,
    /// Configuration values are in conflict with each other
    Conflict,
}

/// Main configuration validator
#[derive(Debug, Default)]
pub struct Validator {
    strict_mode: bool,
}

impl Validator {
    /// Creates a new validator with default settings
    #[must_use]
    pub const fn new() -> Self {
        Self { strict_mode: false }
    }

    /// Enables or disables strict validation mode
    #[must_use]
    pub const fn with_strict_mode(mut self, enabled: bool) -> Self {
        self.strict_mode = enabled;
        self
    }

    /// Validates a complete `FabricConfig` and returns the result
    #[must_use]
    pub fn validate(&self, config: &FabricConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        result.merge(self.validate_clock(&config.clock));
        result.merge(self.validate_admission(&config.admission));
        result.merge(self.validate_computers(&config.computers));
        result.merge(self.validate_log(&config.log));

        for error in FrequencyLadderRule.validate(config) {
            result.add_error(error);
        }
        result
    }

    /// Validates the simulated clock
    #[must_use]
    pub fn validate_clock(&self, config: &ClockConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        if !config.acceleration.is_finite() || config.acceleration <= 0.0 {
            result.add_error(ValidationError::new(
                "clock.acceleration",
                format!(
                    "Acceleration must be a positive finite number, got {}",
                    config.acceleration
                ),
                ErrorCode::OutOfRange,
            ));
        }
        result
    }

    /// Validates the admission controller settings
    #[must_use]
    pub fn validate_admission(&self, config: &AdmissionConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        if self.strict_mode && config.max_applications == 0 {
            result.add_warning(ValidationWarning::with_suggestion(
                "admission.max_applications",
                "Number of concurrent applications is unlimited",
                "Set a cap to bound the number of dispatchers",
            ));
        }
        result
    }

    /// Validates the computer pool layout
    #[must_use]
    pub fn validate_computers(&self, groups: &[ComputerGroupConfig]) -> ValidationResult {
        let mut result = ValidationResult::new();

        if groups.is_empty() {
            result.add_error(ValidationError::new(
                "computers",
                "At least one computer group is required",
                ErrorCode::Required,
            ));
            return result;
        }

        for (i, group) in groups.iter().enumerate() {
            for (name, value) in [
                ("count", group.count),
                ("processors", group.processors),
                ("cores_per_processor", group.cores_per_processor),
            ] {
                if value == 0 {
                    result.add_error(ValidationError::new(
                        format!("computers[{i}].{name}"),
                        format!("{name} must be greater than 0"),
                        ErrorCode::OutOfRange,
                    ));
                }
            }
        }

        let total = groups
            .iter()
            .try_fold(0usize, |total, group| total.checked_add(group.total_cores()?));
        let Some(total) = total else {
            result.add_error(ValidationError::new(
                "computers",
                "Total core count overflows",
                ErrorCode::OutOfRange,
            ));
            return result;
        };
        if total > LARGE_FABRIC_CORES {
            result.add_warning(ValidationWarning::with_suggestion(
                "computers",
                format!("Very large fabric: {total} cores"),
                "Every processor and computer runs as its own task",
            ));
        }
        result
    }

    /// Validates logging configuration settings
    #[must_use]
    pub fn validate_log(&self, config: &LogConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if (config.output == LogOutput::File || config.output == LogOutput::Both)
            && config.file_path.is_none()
        {
            result.add_error(ValidationError::new(
                "log.file_path",
                "file_path must be set when output is 'file' or 'both'",
                ErrorCode::Required,
            ));
        }

        if let Some(parent) = config.file_path.as_ref().and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                result.add_error(ValidationError::new(
                    "log.file_path",
                    format!("Parent directory does not exist: {}", parent.display()),
                    ErrorCode::PathNotFound,
                ));
            }
        }
        result
    }
}

/// Trait for custom validation rules
pub trait ValidationRule {
    /// Validates the configuration and returns a list of errors
    fn validate(&self, config: &FabricConfig) -> Vec<ValidationError>;
    /// Returns the name of this validation rule
    fn name(&self) -> &str;
}

/// Frequency levels of every computer group
pub struct FrequencyLadderRule;

impl FrequencyLadderRule {
    /// Validates one group's admissible frequencies
    #[must_use]
    pub fn validate_group(&self, index: usize, group: &ComputerGroupConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        let field = |name: &str| format!("computers[{index}].{name}");

        if group.levels.is_empty() {
            result.add_error(ValidationError::new(
                field("levels"),
                "At least one frequency level is required",
                ErrorCode::Required,
            ));
            return result;
        }

        let mut seen = HashSet::new();
        for level in &group.levels {
            if !seen.insert(level.frequency) {
                result.add_error(ValidationError::new(
                    field("levels"),
                    format!("Frequency {} is listed twice", level.frequency),
                    ErrorCode::Conflict,
                ));
            }
            if !level.instructions_per_second.is_finite() || level.instructions_per_second <= 0.0
            {
                result.add_error(ValidationError::new(
                    field("levels"),
                    format!(
                        "Throughput at {} must be positive, got {}",
                        level.frequency, level.instructions_per_second
                    ),
                    ErrorCode::OutOfRange,
                ));
            }
        }

        if !seen.contains(&group.default_frequency) {
            result.add_error(ValidationError::new(
                field("default_frequency"),
                format!(
                    "Default frequency {} is not one of the levels",
                    group.default_frequency
                ),
                ErrorCode::Conflict,
            ));
        }

        let mut frequencies: Vec<u32> = seen.into_iter().collect();
        frequencies.sort_unstable();
        let smallest_step = frequencies.windows(2).map(|w| w[1] - w[0]).min();
        if let Some(step) = smallest_step {
            if group.max_frequency_gap < step {
                result.add_warning(ValidationWarning::with_suggestion(
                    field("max_frequency_gap"),
                    format!(
                        "Gap {} is below the smallest frequency step {step}",
                        group.max_frequency_gap
                    ),
                    "Cores stay at the default frequency unless the gap is widened",
                ));
            }
        }
        result
    }
}

impl ValidationRule for FrequencyLadderRule {
    fn validate(&self, config: &FabricConfig) -> Vec<ValidationError> {
        config
            .computers
            .iter()
            .enumerate()
            .flat_map(|(i, group)| self.validate_group(i, group).errors)
            .collect()
    }

    fn name(&self) -> &'static str {
        "FrequencyLadderRule"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrequencyLevelConfig;
    use std::path::PathBuf;

    fn level(frequency: u32, ips: f64) -> FrequencyLevelConfig {
        FrequencyLevelConfig {
            frequency,
            instructions_per_second: ips,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let result = Validator::new().validate(&FabricConfig::default());
        assert!(result.is_valid(), "{:?}", result.errors);
        assert!(!result.has_warnings());
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn test_clock_acceleration_errors() {
        let validator = Validator::new();
        for acceleration in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = validator.validate_clock(&ClockConfig { acceleration });
            assert_eq!(result.errors.len(), 1);
            assert_eq!(result.errors[0].code, ErrorCode::OutOfRange);
        }
    }

    #[test]
    fn test_empty_and_zero_computer_groups() {
        let validator = Validator::new();
        let result = validator.validate_computers(&[]);
        assert_eq!(result.errors[0].code, ErrorCode::Required);

        let group = ComputerGroupConfig {
            count: 0,
            cores_per_processor: 0,
            ..ComputerGroupConfig::default()
        };
        let result = validator.validate_computers(&[group]);
        let fields: Vec<_> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["computers[0].count", "computers[0].cores_per_processor"]
        );
    }

    #[test]
    fn test_frequency_ladder_errors() {
        let group = ComputerGroupConfig {
            default_frequency: 2500,
            levels: vec![level(1500, 1.5e6), level(1500, 2.0e6), level(3000, 0.0)],
            ..ComputerGroupConfig::default()
        };
        let result = FrequencyLadderRule.validate_group(0, &group);
        let codes: Vec<_> = result.errors.iter().map(|e| e.code).collect();
        assert_eq!(
            codes,
            vec![ErrorCode::Conflict, ErrorCode::OutOfRange, ErrorCode::Conflict]
        );

        let empty = ComputerGroupConfig {
            levels: Vec::new(),
            ..ComputerGroupConfig::default()
        };
        assert_eq!(
            FrequencyLadderRule.validate_group(0, &empty).errors[0].code,
            ErrorCode::Required
        );
    }

    #[test]
    fn test_narrow_gap_warns() {
        let group = ComputerGroupConfig {
            max_frequency_gap: 100,
            ..ComputerGroupConfig::default()
        };
        let result = FrequencyLadderRule.validate_group(0, &group);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].suggestion.is_some());
    }

    #[test]
    fn test_large_fabric_warns() {
        let group = ComputerGroupConfig {
            count: 1000,
            processors: 10,
            cores_per_processor: 16,
            ..ComputerGroupConfig::default()
        };
        let result = Validator::new().validate_computers(&[group]);
        assert!(result.is_valid());
        assert!(result.has_warnings());
    }

    #[test]
    fn test_core_count_overflow_is_an_error() {
        let group = ComputerGroupConfig {
            count: usize::MAX,
            processors: 2,
            ..ComputerGroupConfig::default()
        };
        assert_eq!(group.total_cores(), None);

        let result = Validator::new().validate_computers(&[group]);
        assert!(!result.is_valid());
        assert_eq!(result.errors[0].code, ErrorCode::OutOfRange);
    }

    #[test]
    fn test_log_validation() {
        let validator = Validator::new();
        let config = LogConfig {
            output: LogOutput::Both,
            ..LogConfig::default()
        };
        assert_eq!(
            validator.validate_log(&config).errors[0].code,
            ErrorCode::Required
        );

        let config = LogConfig {
            output: LogOutput::File,
            file_path: Some(PathBuf::from("/nonexistent/dir/fabric.log")),
            ..LogConfig::default()
        };
        assert_eq!(
            validator.validate_log(&config).errors[0].code,
            ErrorCode::PathNotFound
        );

        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            output: LogOutput::File,
            file_path: Some(dir.path().join("fabric.log")),
            ..LogConfig::default()
        };
        assert!(validator.validate_log(&config).is_valid());
    }

    #[test]
    fn test_strict_mode_warns_on_unlimited_admission() {
        let config = AdmissionConfig {
            max_applications: 0,
        };
        assert!(!Validator::new().validate_admission(&config).has_warnings());
        assert!(
            Validator::new()
                .with_strict_mode(true)
                .validate_admission(&config)
                .has_warnings()
        );
    }

    #[test]
    fn test_errors_accumulate_into_one() {
        let mut config = FabricConfig::default();
        config.clock.acceleration = 0.0;
        config.computers[0].levels.clear();

        let result = Validator::new().validate(&config);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(FrequencyLadderRule.name(), "FrequencyLadderRule");
        match result.into_result() {
            Err(ConfigError::Validation(message)) => {
                assert!(message.contains("clock.acceleration"));
                assert!(message.contains("computers[0].levels"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
