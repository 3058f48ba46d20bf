//! Processors: groups of cores under a shared frequency-coherence rule
//!
//! The invariant enforced here is that, at every observable instant, the
//! frequencies of any two cores of a processor differ by at most
//! `max_frequency_gap`. [`Processor`] holds the pure state and rules;
//! [`ProcessorHandle`] runs it as a task and owns the completion timers.

mod actor;

pub use actor::ProcessorHandle;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::clock::SimInstant;
use crate::cpu::{Completion, Core};
use crate::state::{ProcessorDynamicState, ProcessorStaticState};
use crate::types::{Frequency, ProcessorId, Task};
use crate::{HwError, Result};

/// An admissible frequency and the throughput a core reaches at it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyLevel {
    /// Frequency in MHz
    pub frequency: Frequency,
    /// Instructions retired per simulated second
    pub instructions_per_second: f64,
}

impl FrequencyLevel {
    /// Create a frequency level
    #[must_use]
    pub const fn new(frequency: Frequency, instructions_per_second: f64) -> Self {
        Self {
            frequency,
            instructions_per_second,
        }
    }
}

/// Construction parameters of a processor
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorSpec {
    /// Processor id, unique across the fabric
    pub id: ProcessorId,
    /// Number of cores
    pub cores: usize,
    /// Frequency every core starts at
    pub default_frequency: Frequency,
    /// Maximum allowed gap between any two core frequencies
    pub max_frequency_gap: u32,
    /// Instructions per second for each admissible frequency
    pub processing_power: BTreeMap<Frequency, f64>,
}

impl ProcessorSpec {
    /// Create a spec from its frequency levels
    pub fn new(
        id: ProcessorId,
        cores: usize,
        levels: impl IntoIterator<Item = FrequencyLevel>,
        default_frequency: Frequency,
        max_frequency_gap: u32,
    ) -> Self {
        Self {
            id,
            cores,
            default_frequency,
            max_frequency_gap,
            processing_power: levels
                .into_iter()
                .map(|level| (level.frequency, level.instructions_per_second))
                .collect(),
        }
    }

    /// Same spec under another id
    #[must_use]
    pub fn with_id(mut self, id: ProcessorId) -> Self {
        self.id = id;
        self
    }

    /// Check the spec describes a usable processor
    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 {
            return Err(HwError::InvalidConfig(format!(
                "{} must have at least one core",
                self.id
            )));
        }
        if self.processing_power.is_empty() {
            return Err(HwError::InvalidConfig(format!(
                "{} has no admissible frequency",
                self.id
            )));
        }
        if !self.is_admissible(self.default_frequency) {
            return Err(HwError::InvalidConfig(format!(
                "default frequency {} of {} is not admissible",
                self.default_frequency, self.id
            )));
        }
        for (frequency, power) in &self.processing_power {
            if !power.is_finite() || *power <= 0.0 {
                return Err(HwError::InvalidConfig(format!(
                    "processing power at {frequency} on {} must be positive, got {power}",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Admissible frequencies, ascending
    pub fn admissible_frequencies(&self) -> impl Iterator<Item = Frequency> + '_ {
        self.processing_power.keys().copied()
    }

    /// True if `frequency` is admissible
    #[must_use]
    pub fn is_admissible(&self, frequency: Frequency) -> bool {
        self.processing_power.contains_key(&frequency)
    }

    /// Instructions per second at `frequency`
    #[must_use]
    pub fn power(&self, frequency: Frequency) -> Option<f64> {
        self.processing_power.get(&frequency).copied()
    }

    /// Smallest admissible frequency strictly above `frequency`
    #[must_use]
    pub fn next_higher(&self, frequency: Frequency) -> Option<Frequency> {
        self.processing_power
            .range((Bound::Excluded(frequency), Bound::Unbounded))
            .next()
            .map(|(f, _)| *f)
    }

    /// Largest admissible frequency strictly below `frequency`
    #[must_use]
    pub fn next_lower(&self, frequency: Frequency) -> Option<Frequency> {
        self.processing_power
            .range(..frequency)
            .next_back()
            .map(|(f, _)| *f)
    }

    /// Frequency levels, ascending
    #[must_use]
    pub fn levels(&self) -> Vec<FrequencyLevel> {
        self.processing_power
            .iter()
            .map(|(f, p)| FrequencyLevel::new(*f, *p))
            .collect()
    }
}

/// Receives the tasks a processor finishes on behalf of a requester
pub trait TaskCompletionSink: Send + Sync + fmt::Debug {
    /// Deliver a finished task
    fn notify_end_of_task(&self, task: Task) -> Result<()>;
}

impl TaskCompletionSink for mpsc::UnboundedSender<Task> {
    fn notify_end_of_task(&self, task: Task) -> Result<()> {
        self.send(task)
            .map_err(|e| HwError::Notification(format!("end of {} not delivered", e.0.id)))
    }
}

/// Processor state: its cores and the rules governing them
#[derive(Debug)]
pub struct Processor {
    spec: ProcessorSpec,
    cores: Vec<Core>,
    completed_tasks: u64,
}

impl Processor {
    /// Build a processor with every core idle at the default frequency
    pub fn new(spec: ProcessorSpec) -> Result<Self> {
        spec.validate()?;
        let cores = (0..spec.cores)
            .map(|index| Core::new(index, spec.default_frequency))
            .collect();
        Ok(Self {
            spec,
            cores,
            completed_tasks: 0,
        })
    }

    /// Processor id
    #[inline]
    #[must_use]
    pub fn id(&self) -> ProcessorId {
        self.spec.id
    }

    /// Construction parameters
    #[must_use]
    pub const fn spec(&self) -> &ProcessorSpec {
        &self.spec
    }

    /// All cores in index order
    #[must_use]
    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    /// Core `core_no`
    pub fn core(&self, core_no: usize) -> Result<&Core> {
        self.cores.get(core_no).ok_or(HwError::InvalidCore {
            processor: self.spec.id,
            core: core_no,
        })
    }

    fn core_mut(&mut self, core_no: usize) -> Result<&mut Core> {
        let processor = self.spec.id;
        self.cores.get_mut(core_no).ok_or(HwError::InvalidCore {
            processor,
            core: core_no,
        })
    }

    /// Tasks completed so far
    #[must_use]
    pub const fn completed_tasks(&self) -> u64 {
        self.completed_tasks
    }

    /// True iff `frequency` on `core_no` stays within the max gap of every other core
    pub fn is_currently_possible_frequency_for_core(
        &self,
        core_no: usize,
        frequency: Frequency,
    ) -> Result<bool> {
        self.core(core_no)?;
        Ok(self
            .cores
            .iter()
            .filter(|core| core.index() != core_no)
            .all(|core| core.frequency().gap(frequency) <= self.spec.max_frequency_gap))
    }

    /// Change the frequency of `core_no`
    ///
    /// Returns the rescheduled completion when the core was busy.
    pub fn set_core_frequency(
        &mut self,
        core_no: usize,
        frequency: Frequency,
        now: SimInstant,
    ) -> Result<Option<Completion>> {
        let Some(new_power) = self.spec.power(frequency) else {
            return Err(HwError::UnavailableFrequency {
                processor: self.spec.id,
                frequency,
            });
        };
        if !self.is_currently_possible_frequency_for_core(core_no, frequency)? {
            return Err(HwError::UnacceptableFrequency {
                processor: self.spec.id,
                core: core_no,
                frequency,
                max_gap: self.spec.max_frequency_gap,
            });
        }

        let old_frequency = self.core(core_no)?.frequency();
        let old_power = self.spec.power(old_frequency).unwrap_or(new_power);
        let core = self.core_mut(core_no)?;
        Ok(core.set_frequency(frequency, now, old_power, new_power))
    }

    /// Start `task` on idle core `core_no`
    pub fn start_task(&mut self, core_no: usize, task: Task, now: SimInstant) -> Result<Completion> {
        let processor = self.spec.id;
        let frequency = self.core(core_no)?.frequency();
        let power = self.spec.power(frequency).ok_or(HwError::UnavailableFrequency {
            processor,
            frequency,
        })?;
        let core = self.core_mut(core_no)?;
        if !core.is_idle() {
            return Err(HwError::CoreBusy {
                processor,
                core: core_no,
            });
        }
        Ok(core.start_task(task, now, power))
    }

    /// Record the timer armed for a completion of `core_no`
    pub fn attach_timer(&mut self, core_no: usize, epoch: u64, timer: AbortHandle) {
        match self.cores.get_mut(core_no) {
            Some(core) => core.attach_timer(epoch, timer),
            None => timer.abort(),
        }
    }

    /// Finish the task on `core_no` if `epoch` is current
    pub fn complete_task(&mut self, core_no: usize, epoch: u64) -> Option<Task> {
        let task = self.cores.get_mut(core_no)?.complete(epoch)?;
        self.completed_tasks += 1;
        Some(task)
    }

    /// Cancel every pending completion timer
    pub fn cancel_timers(&mut self) {
        for core in &mut self.cores {
            core.cancel_timer();
        }
    }

    /// Immutable configuration snapshot
    #[must_use]
    pub fn static_state(&self) -> ProcessorStaticState {
        ProcessorStaticState {
            id: self.spec.id,
            cores: self.cores.len(),
            default_frequency: self.spec.default_frequency,
            max_frequency_gap: self.spec.max_frequency_gap,
            levels: self.spec.levels(),
        }
    }

    /// Live per-core snapshot stamped with `now`
    #[must_use]
    pub fn dynamic_state(&self, now: SimInstant) -> ProcessorDynamicState {
        ProcessorDynamicState {
            id: self.spec.id,
            timestamp: now,
            idle: self.cores.iter().map(Core::is_idle).collect(),
            frequencies: self.cores.iter().map(Core::frequency).collect(),
            completed_tasks: self.completed_tasks,
        }
    }
}
