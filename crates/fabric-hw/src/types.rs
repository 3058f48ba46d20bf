//! Identifiers and work items shared across the fabric

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Core clock frequency in MHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Frequency(pub u32);

impl Frequency {
    /// Create a frequency from MHz
    #[inline]
    #[must_use]
    pub const fn new(mhz: u32) -> Self {
        Self(mhz)
    }

    /// Value in MHz
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Absolute distance to another frequency
    #[inline]
    #[must_use]
    pub const fn gap(self, other: Self) -> u32 {
        self.0.abs_diff(other.0)
    }
}

impl From<u32> for Frequency {
    fn from(mhz: u32) -> Self {
        Self(mhz)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MHz", self.0)
    }
}

/// Processor identifier, unique across a fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessorId(pub u32);

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "processor-{}", self.0)
    }
}

/// Computer identifier, unique across a fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComputerId(pub u32);

impl fmt::Display for ComputerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "computer-{}", self.0)
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque task identifier
///
/// Allocated from a process-wide counter so that tasks submitted by different
/// application VMs never collide on a shared processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Allocate a fresh task id
    #[must_use]
    pub fn next() -> Self {
        // Relaxed: uniqueness only, no ordering with other memory
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Externally supplied unit of work
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    /// Unique request URI chosen by the submitter
    pub uri: String,
    /// Predicted number of instructions needed to serve the request
    pub instructions: u64,
}

impl Request {
    /// Create a request
    pub fn new(uri: impl Into<String>, instructions: u64) -> Self {
        Self {
            uri: uri.into(),
            instructions,
        }
    }
}

/// A request accepted by an application VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Fresh identifier assigned on acceptance
    pub id: TaskId,
    /// Request this task serves
    pub request: Request,
}

impl Task {
    /// Wrap a request under a fresh task id
    #[must_use]
    pub fn new(request: Request) -> Self {
        Self {
            id: TaskId::next(),
            request,
        }
    }

    /// Predicted instruction count of the underlying request
    #[inline]
    #[must_use]
    pub fn instructions(&self) -> u64 {
        self.request.instructions
    }
}
