//! Processor task and its handle

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use super::{Processor, ProcessorSpec, TaskCompletionSink};
use crate::clock::{Clock, SharedClock};
use crate::cpu::Completion;
use crate::state::{ProcessorDynamicState, ProcessorStaticState};
use crate::types::{Frequency, ProcessorId, Task, TaskId};
use crate::{HwError, Result};

enum Command {
    Execute {
        core: usize,
        task: Task,
        notify: Option<Arc<dyn TaskCompletionSink>>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetFrequency {
        core: usize,
        frequency: Frequency,
        reply: oneshot::Sender<Result<()>>,
    },
    IsPossibleFrequency {
        core: usize,
        frequency: Frequency,
        reply: oneshot::Sender<Result<bool>>,
    },
    CoreFrequency {
        core: usize,
        reply: oneshot::Sender<Result<Frequency>>,
    },
    StaticState {
        reply: oneshot::Sender<ProcessorStaticState>,
    },
    DynamicState {
        reply: oneshot::Sender<ProcessorDynamicState>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
struct TimerFired {
    core: usize,
    epoch: u64,
}

/// Cloneable entry point to a running processor
///
/// Every call is serialized through the processor's mailbox, so the
/// processor's state needs no locking.
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    id: ProcessorId,
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execute { core, task, .. } => write!(f, "Execute({core}, {})", task.id),
            Self::SetFrequency { core, frequency, .. } => {
                write!(f, "SetFrequency({core}, {frequency})")
            }
            Self::IsPossibleFrequency { core, frequency, .. } => {
                write!(f, "IsPossibleFrequency({core}, {frequency})")
            }
            Self::CoreFrequency { core, .. } => write!(f, "CoreFrequency({core})"),
            Self::StaticState { .. } => f.write_str("StaticState"),
            Self::DynamicState { .. } => f.write_str("DynamicState"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl ProcessorHandle {
    /// Validate `spec` and start the processor on the current tokio runtime
    pub fn spawn(spec: ProcessorSpec, clock: SharedClock) -> Result<Self> {
        let processor = Processor::new(spec)?;
        let id = processor.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        info!(
            processor = %id,
            cores = processor.cores().len(),
            default_frequency = %processor.spec().default_frequency,
            "Processor started"
        );

        let actor = ProcessorActor {
            processor,
            clock,
            notify: HashMap::new(),
            timer_tx,
            failed_notifications: 0,
        };
        tokio::spawn(actor.run(rx, timer_rx));

        Ok(Self { id, tx })
    }

    /// Processor id
    #[inline]
    #[must_use]
    pub fn id(&self) -> ProcessorId {
        self.id
    }

    /// Start `task` on idle core `core_no`
    pub async fn execute_task_on_core(&self, core_no: usize, task: Task) -> Result<()> {
        self.call(|reply| Command::Execute {
            core: core_no,
            task,
            notify: None,
            reply,
        })
        .await?
    }

    /// Start `task` on idle core `core_no` and deliver it to `notify` once finished
    pub async fn execute_task_on_core_and_notify(
        &self,
        core_no: usize,
        task: Task,
        notify: Arc<dyn TaskCompletionSink>,
    ) -> Result<()> {
        self.call(|reply| Command::Execute {
            core: core_no,
            task,
            notify: Some(notify),
            reply,
        })
        .await?
    }

    /// Set the frequency of `core_no`
    ///
    /// Fails with [`HwError::UnavailableFrequency`] for a frequency outside the
    /// admissible set and [`HwError::UnacceptableFrequency`] when another core is
    /// more than the max gap away.
    pub async fn set_core_frequency(&self, core_no: usize, frequency: Frequency) -> Result<()> {
        self.call(|reply| Command::SetFrequency {
            core: core_no,
            frequency,
            reply,
        })
        .await?
    }

    /// True iff `frequency` on `core_no` would respect the max gap against every other core
    pub async fn is_currently_possible_frequency_for_core(
        &self,
        core_no: usize,
        frequency: Frequency,
    ) -> Result<bool> {
        self.call(|reply| Command::IsPossibleFrequency {
            core: core_no,
            frequency,
            reply,
        })
        .await?
    }

    /// Current frequency of `core_no`
    pub async fn core_frequency(&self, core_no: usize) -> Result<Frequency> {
        self.call(|reply| Command::CoreFrequency {
            core: core_no,
            reply,
        })
        .await?
    }

    /// Immutable configuration snapshot
    pub async fn static_state(&self) -> Result<ProcessorStaticState> {
        self.call(|reply| Command::StaticState { reply }).await
    }

    /// Live per-core snapshot
    pub async fn dynamic_state(&self) -> Result<ProcessorDynamicState> {
        self.call(|reply| Command::DynamicState { reply }).await
    }

    /// Stop the processor, cancelling every pending completion
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    /// True while the processor task is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| HwError::Disconnected(self.id.to_string()))?;
        rx.await.map_err(|_| HwError::Disconnected(self.id.to_string()))
    }
}

struct ProcessorActor {
    processor: Processor,
    clock: SharedClock,
    notify: HashMap<TaskId, Arc<dyn TaskCompletionSink>>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    failed_notifications: u64,
}

impl ProcessorActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                Some(fired) = timers.recv() => self.on_timer(fired),
            }
        }

        self.processor.cancel_timers();
        debug!(
            processor = %self.processor.id(),
            completed = self.processor.completed_tasks(),
            failed_notifications = self.failed_notifications,
            "Processor stopped"
        );
    }

    fn handle(&mut self, command: Command) {
        trace!(processor = %self.processor.id(), ?command, "Processor command");
        match command {
            Command::Execute {
                core,
                task,
                notify,
                reply,
            } => {
                let _ = reply.send(self.execute(core, task, notify));
            }
            Command::SetFrequency {
                core,
                frequency,
                reply,
            } => {
                let _ = reply.send(self.set_frequency(core, frequency));
            }
            Command::IsPossibleFrequency {
                core,
                frequency,
                reply,
            } => {
                let _ = reply.send(
                    self.processor
                        .is_currently_possible_frequency_for_core(core, frequency),
                );
            }
            Command::CoreFrequency { core, reply } => {
                let _ = reply.send(self.processor.core(core).map(|c| c.frequency()));
            }
            Command::StaticState { reply } => {
                let _ = reply.send(self.processor.static_state());
            }
            Command::DynamicState { reply } => {
                let _ = reply.send(self.processor.dynamic_state(self.clock.now()));
            }
            Command::Shutdown => {}
        }
    }

    fn execute(
        &mut self,
        core: usize,
        task: Task,
        notify: Option<Arc<dyn TaskCompletionSink>>,
    ) -> Result<()> {
        let task_id = task.id;
        let completion = self.processor.start_task(core, task, self.clock.now())?;
        debug!(
            processor = %self.processor.id(),
            core,
            task = %task_id,
            duration = %completion.delay,
            "Task started"
        );
        if let Some(sink) = notify {
            self.notify.insert(task_id, sink);
        }
        self.arm(completion);
        Ok(())
    }

    fn set_frequency(&mut self, core: usize, frequency: Frequency) -> Result<()> {
        let now = self.clock.now();
        match self.processor.set_core_frequency(core, frequency, now) {
            Ok(rescheduled) => {
                debug!(processor = %self.processor.id(), core, %frequency, "Core frequency set");
                if let Some(completion) = rescheduled {
                    debug!(
                        processor = %self.processor.id(),
                        core,
                        remaining = %completion.delay,
                        "Running task rescheduled"
                    );
                    self.arm(completion);
                }
                Ok(())
            }
            Err(e) => {
                warn!(processor = %self.processor.id(), core, %frequency, error = %e, "Frequency change rejected");
                Err(e)
            }
        }
    }

    fn arm(&mut self, completion: Completion) {
        let tx = self.timer_tx.clone();
        let sleep = self.clock.sleep(completion.delay);
        let fired = TimerFired {
            core: completion.core,
            epoch: completion.epoch,
        };
        let timer = tokio::spawn(async move {
            sleep.await;
            let _ = tx.send(fired);
        });
        self.processor
            .attach_timer(completion.core, completion.epoch, timer.abort_handle());
    }

    fn on_timer(&mut self, fired: TimerFired) {
        let Some(task) = self.processor.complete_task(fired.core, fired.epoch) else {
            trace!(processor = %self.processor.id(), core = fired.core, epoch = fired.epoch, "Stale completion ignored");
            return;
        };
        debug!(processor = %self.processor.id(), core = fired.core, task = %task.id, "Task completed");

        if let Some(sink) = self.notify.remove(&task.id) {
            let task_id = task.id;
            if let Err(e) = sink.notify_end_of_task(task) {
                self.failed_notifications += 1;
                error!(processor = %self.processor.id(), task = %task_id, error = %e, "End-of-task notification failed");
            }
        }
    }
}
