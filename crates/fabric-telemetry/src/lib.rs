//! Telemetry for the compute fabric
//!
//! This crate provides structured logging with tracing. Components log
//! through the `tracing` macros directly; this crate only installs the
//! global subscriber.

pub mod logging;

pub use logging::*;

use thiserror::Error;

/// Telemetry error types
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),

    /// Logging error
    #[error("Logging error: {0}")]
    Logging(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
