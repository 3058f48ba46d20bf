//! Scheduling layer of the compute fabric
//!
//! # Key Components
//!
//! - **Application VM**: holds reserved cores and a FIFO task queue for one application
//! - **Request Dispatcher**: least-recently-used routing across an application's VMs,
//!   with a running execution-time average
//! - **Admission Controller**: reserves cores across computers for a whole
//!   application or for none of it, then deploys its dispatcher and VMs
//! - **Data Center**: builds the computer pool and admission controller from configuration

pub mod admission;
pub mod avm;
pub mod datacenter;
pub mod dispatcher;
pub mod ema;
pub mod notify;
pub mod types;

pub use admission::{
    Admission, AdmissionHandle, AdmissionState, ApplicationDemand, DeployedApplication,
    RejectionReason,
};
pub use avm::{AvmHandle, AvmState};
pub use datacenter::DataCenter;
pub use dispatcher::{DispatcherHandle, DispatcherStats};
pub use ema::ExponentialMovingAverage;
pub use notify::{RequestNotificationSink, RequestSubmission};
pub use types::{AvmId, DispatcherId};

use thiserror::Error;

/// Scheduler error types
#[derive(Debug, Error)]
pub enum SchedError {
    /// Hardware layer error
    #[error("Hardware error: {0}")]
    Hw(#[from] fabric_hw::HwError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] fabric_config::ConfigError),

    /// Application demand cannot be satisfied by any fabric
    #[error("Invalid demand: {0}")]
    InvalidDemand(String),

    /// Completion reported for a task that is not running
    #[error("Unknown task: {0}")]
    UnknownTask(fabric_hw::TaskId),

    /// No deployed application under this dispatcher id
    #[error("Unknown application: {0}")]
    UnknownApplication(DispatcherId),

    /// Core allocation without any core
    #[error("{0} was given an empty core allocation")]
    EmptyAllocation(AvmId),

    /// Component mailbox closed
    #[error("{0} is no longer running")]
    Disconnected(String),

    /// Notification could not be delivered
    #[error("Notification error: {0}")]
    Notification(String),
}

/// Result type for scheduling operations
pub type Result<T> = std::result::Result<T, SchedError>;
