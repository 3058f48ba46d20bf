//! Simulated compute hardware for the fabric
//!
//! This crate models the physical side of the data center:
//!
//! - **Clock**: simulated time scaled from wall-clock time by an acceleration factor
//! - **Core**: executes at most one task at a configurable frequency
//! - **Processor**: owns cores and enforces the max-frequency-gap invariant
//! - **Computer**: owns processors and is the unit of core reservation
//!
//! Processors and computers each run as a tokio task fed by a mailbox; the
//! cloneable [`ProcessorHandle`] and [`ComputerHandle`] types are their only
//! entry points.

pub mod clock;
pub mod computer;
pub mod cpu;
pub mod processor;
pub mod state;
pub mod types;

pub use clock::{AcceleratedClock, Clock, SharedClock, SimDuration, SimInstant};
pub use computer::{AllocatedCore, ComputerHandle, ComputerSpec, ReservationTable};
pub use cpu::Core;
pub use processor::{
    FrequencyLevel, Processor, ProcessorHandle, ProcessorSpec, TaskCompletionSink,
};
pub use state::{
    ComputerDynamicState, ComputerStaticState, ProcessorDynamicState, ProcessorStaticState,
};
pub use types::{ComputerId, Frequency, ProcessorId, Request, Task, TaskId};

use thiserror::Error;

/// Hardware error types
#[derive(Debug, Error)]
pub enum HwError {
    /// Requested frequency is not in the processor's admissible set
    #[error("frequency {frequency} is not admissible on processor {processor}")]
    UnavailableFrequency {
        /// Processor that rejected the request
        processor: ProcessorId,
        /// Rejected frequency
        frequency: Frequency,
    },

    /// Requested frequency would break the max-frequency-gap invariant
    #[error("frequency {frequency} on core {core} of processor {processor} exceeds the max gap of {max_gap}")]
    UnacceptableFrequency {
        /// Processor that rejected the request
        processor: ProcessorId,
        /// Target core
        core: usize,
        /// Rejected frequency
        frequency: Frequency,
        /// Configured maximum gap between any two cores
        max_gap: u32,
    },

    /// Core number out of range
    #[error("processor {processor} has no core {core}")]
    InvalidCore {
        /// Processor addressed
        processor: ProcessorId,
        /// Out-of-range core number
        core: usize,
    },

    /// Core already executing a task
    #[error("core {core} of processor {processor} is busy")]
    CoreBusy {
        /// Processor addressed
        processor: ProcessorId,
        /// Busy core
        core: usize,
    },

    /// Processor id not owned by the computer
    #[error("computer {computer} has no processor {processor}")]
    UnknownProcessor {
        /// Computer addressed
        computer: ComputerId,
        /// Unknown processor id
        processor: ProcessorId,
    },

    /// Released core was not reserved. Indicates a bookkeeping bug.
    #[error("invariant violation: core {core} of processor {processor_index} on computer {computer} is not reserved")]
    CoreNotReserved {
        /// Computer addressed
        computer: ComputerId,
        /// Processor position inside the computer
        processor_index: usize,
        /// Core number
        core: usize,
    },

    /// Core handle belongs to another computer
    #[error("core handle of computer {owner} released on computer {computer}")]
    ForeignCore {
        /// Computer addressed
        computer: ComputerId,
        /// Computer the handle was issued by
        owner: ComputerId,
    },

    /// Invalid hardware description
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Component mailbox closed
    #[error("{0} is no longer running")]
    Disconnected(String),

    /// Notification could not be delivered
    #[error("Notification error: {0}")]
    Notification(String),
}

/// Result type for fabric-hw operations
pub type Result<T> = std::result::Result<T, HwError>;
