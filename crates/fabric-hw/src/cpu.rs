//! Single execution core
//!
//! A [`Core`] is plain state owned by its processor. It knows which task it is
//! running and when that task is due to finish; arming the actual completion
//! timer is left to the owner, which hands the timer's abort handle back via
//! [`Core::attach_timer`] so a frequency change can cancel it.

use tokio::task::AbortHandle;

use crate::clock::{SimDuration, SimInstant};
use crate::types::{Frequency, Task};

/// Completion the owner must arm a timer for
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    /// Core number inside the processor
    pub core: usize,
    /// Scheduling epoch; a timer firing with an older epoch is stale
    pub epoch: u64,
    /// Simulated delay from now until completion
    pub delay: SimDuration,
    /// Simulated instant of completion
    pub at: SimInstant,
}

#[derive(Debug)]
struct Running {
    task: Task,
    completes_at: SimInstant,
    timer: Option<AbortHandle>,
}

/// Executes at most one task at a time at its current frequency
#[derive(Debug)]
pub struct Core {
    index: usize,
    frequency: Frequency,
    running: Option<Running>,
    epoch: u64,
}

impl Core {
    /// Create an idle core
    #[must_use]
    pub const fn new(index: usize, frequency: Frequency) -> Self {
        Self {
            index,
            frequency,
            running: None,
            epoch: 0,
        }
    }

    /// Core number inside its processor
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Current frequency
    #[inline]
    #[must_use]
    pub const fn frequency(&self) -> Frequency {
        self.frequency
    }

    /// True when no task is running
    #[inline]
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.running.is_none()
    }

    /// Task currently running, if any
    #[must_use]
    pub fn running_task(&self) -> Option<&Task> {
        self.running.as_ref().map(|r| &r.task)
    }

    /// Simulated instant at which the running task completes
    #[must_use]
    pub fn completes_at(&self) -> Option<SimInstant> {
        self.running.as_ref().map(|r| r.completes_at)
    }

    /// Start `task` at `now`, running at `instructions_per_second`
    ///
    /// The caller must have checked that the core is idle.
    pub fn start_task(
        &mut self,
        task: Task,
        now: SimInstant,
        instructions_per_second: f64,
    ) -> Completion {
        debug_assert!(self.is_idle(), "core {} already running a task", self.index);

        let delay = SimDuration::for_work(task.instructions(), instructions_per_second);
        self.epoch += 1;
        let at = now + delay;
        self.running = Some(Running {
            task,
            completes_at: at,
            timer: None,
        });

        Completion {
            core: self.index,
            epoch: self.epoch,
            delay,
            at,
        }
    }

    /// Record the timer armed for a completion
    ///
    /// A handle for an epoch that is no longer current is aborted immediately.
    pub fn attach_timer(&mut self, epoch: u64, timer: AbortHandle) {
        match self.running.as_mut() {
            Some(running) if epoch == self.epoch => {
                if let Some(previous) = running.timer.replace(timer) {
                    previous.abort();
                }
            }
            _ => timer.abort(),
        }
    }

    /// Change the frequency
    ///
    /// When busy, the pending timer is cancelled and the remaining work is
    /// rescaled by `old_power / new_power`; the returned completion must be
    /// re-armed by the owner.
    pub fn set_frequency(
        &mut self,
        frequency: Frequency,
        now: SimInstant,
        old_power: f64,
        new_power: f64,
    ) -> Option<Completion> {
        let rescheduled = match self.running.as_mut() {
            None => None,
            Some(running) => {
                if let Some(timer) = running.timer.take() {
                    timer.abort();
                }
                let remaining = running.completes_at.saturating_duration_since(now);
                let delay = remaining.mul_f64(old_power / new_power);
                running.completes_at = now + delay;
                self.epoch += 1;
                Some(Completion {
                    core: self.index,
                    epoch: self.epoch,
                    delay,
                    at: running.completes_at,
                })
            }
        };
        self.frequency = frequency;
        rescheduled
    }

    /// Finish the running task if `epoch` is current
    ///
    /// Returns `None` for stale timer events.
    pub fn complete(&mut self, epoch: u64) -> Option<Task> {
        if epoch != self.epoch {
            return None;
        }
        self.running.take().map(|running| running.task)
    }

    /// Cancel any pending completion timer without finishing the task
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.running.as_mut().and_then(|r| r.timer.take()) {
            timer.abort();
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
