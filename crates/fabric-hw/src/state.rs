//! Read-only state snapshots for external telemetry collectors

use serde::{Deserialize, Serialize};

use crate::clock::SimInstant;
use crate::processor::FrequencyLevel;
use crate::types::{ComputerId, Frequency, ProcessorId};

/// Immutable configuration of a processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorStaticState {
    /// Processor id
    pub id: ProcessorId,
    /// Number of cores
    pub cores: usize,
    /// Frequency every core starts at
    pub default_frequency: Frequency,
    /// Maximum allowed gap between any two core frequencies
    pub max_frequency_gap: u32,
    /// Admissible frequencies with their processing power, ascending
    pub levels: Vec<FrequencyLevel>,
}

impl ProcessorStaticState {
    /// Admissible frequencies, ascending
    #[must_use]
    pub fn admissible_frequencies(&self) -> Vec<Frequency> {
        self.levels.iter().map(|level| level.frequency).collect()
    }
}

/// Live per-core view of a processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorDynamicState {
    /// Processor id
    pub id: ProcessorId,
    /// Simulated time of the snapshot
    pub timestamp: SimInstant,
    /// Idle flag per core
    pub idle: Vec<bool>,
    /// Frequency per core
    pub frequencies: Vec<Frequency>,
    /// Tasks completed since start
    pub completed_tasks: u64,
}

impl ProcessorDynamicState {
    /// Number of idle cores
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.iter().filter(|idle| **idle).count()
    }
}

/// Immutable layout of a computer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputerStaticState {
    /// Computer id
    pub id: ComputerId,
    /// Processor ids in index order
    pub processors: Vec<ProcessorId>,
    /// Core count per processor, in index order
    pub cores_per_processor: Vec<usize>,
}

impl ComputerStaticState {
    /// Total number of cores
    #[must_use]
    pub fn total_cores(&self) -> usize {
        self.cores_per_processor.iter().sum()
    }
}

/// Live reservation and frequency tables of a computer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputerDynamicState {
    /// Computer id
    pub id: ComputerId,
    /// Simulated time of the snapshot
    pub timestamp: SimInstant,
    /// Reservation bit per processor, per core
    pub reserved: Vec<Vec<bool>>,
    /// Known frequency per processor, per core
    pub frequencies: Vec<Vec<Frequency>>,
}

impl ComputerDynamicState {
    /// Number of reserved cores
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.reserved.iter().flatten().filter(|r| **r).count()
    }

    /// Number of cores not reserved
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.reserved.iter().flatten().filter(|r| !**r).count()
    }
}
