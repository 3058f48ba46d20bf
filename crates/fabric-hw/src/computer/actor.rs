//! Computer task and its handle

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{AllocatedCore, ComputerSpec, ReservationTable};
use crate::clock::{Clock, SharedClock};
use crate::processor::{ProcessorHandle, ProcessorSpec};
use crate::state::{ComputerDynamicState, ComputerStaticState};
use crate::types::{ComputerId, ProcessorId};
use crate::{HwError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Up,
    Down,
}

enum Command {
    AllocateCore {
        reply: oneshot::Sender<Option<AllocatedCore>>,
    },
    AllocateCores {
        count: usize,
        reply: oneshot::Sender<Vec<AllocatedCore>>,
    },
    ReleaseCores {
        cores: Vec<AllocatedCore>,
        reply: oneshot::Sender<Result<()>>,
    },
    StepFrequency {
        core: usize,
        processor: ProcessorId,
        step: Step,
        reply: oneshot::Sender<Result<bool>>,
    },
    StaticState {
        reply: oneshot::Sender<ComputerStaticState>,
    },
    DynamicState {
        reply: oneshot::Sender<ComputerDynamicState>,
    },
    Shutdown,
}

/// Cloneable entry point to a running computer
#[derive(Debug, Clone)]
pub struct ComputerHandle {
    id: ComputerId,
    tx: mpsc::UnboundedSender<Command>,
    processors: Arc<[ProcessorHandle]>,
}

impl ComputerHandle {
    /// Validate `spec`, start its processors and then the computer itself
    pub fn spawn(spec: ComputerSpec, clock: SharedClock) -> Result<Self> {
        spec.validate()?;
        let table = ReservationTable::for_spec(&spec);
        let processors = spec
            .processors
            .iter()
            .map(|p| ProcessorHandle::spawn(p.clone(), clock.clone()))
            .collect::<Result<Vec<_>>>()?;
        let processors: Arc<[ProcessorHandle]> = processors.into();

        info!(
            computer = %spec.id,
            processors = processors.len(),
            cores = table.total(),
            "Computer started"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ComputerActor {
            id: spec.id,
            specs: spec.processors,
            processors: processors.clone(),
            table,
            clock,
        };
        tokio::spawn(actor.run(rx));

        Ok(Self {
            id: spec.id,
            tx,
            processors,
        })
    }

    /// Computer id
    #[inline]
    #[must_use]
    pub fn id(&self) -> ComputerId {
        self.id
    }

    /// Processors in index order
    #[must_use]
    pub fn processors(&self) -> &[ProcessorHandle] {
        &self.processors
    }

    /// Reserve the first free core, or `None` when every core is reserved
    pub async fn allocate_core(&self) -> Result<Option<AllocatedCore>> {
        self.call(|reply| Command::AllocateCore { reply }).await
    }

    /// Reserve up to `count` cores
    ///
    /// Returns however many could be reserved. Nothing is rolled back here:
    /// a caller that needs all or nothing releases a short grant itself.
    pub async fn allocate_cores(&self, count: usize) -> Result<Vec<AllocatedCore>> {
        self.call(|reply| Command::AllocateCores { count, reply })
            .await
    }

    /// Release one reserved core
    pub async fn release_core(&self, core: AllocatedCore) -> Result<()> {
        self.release_cores(vec![core]).await
    }

    /// Release reserved cores
    ///
    /// Every handle is processed; the first invariant violation met is
    /// returned.
    pub async fn release_cores(&self, cores: Vec<AllocatedCore>) -> Result<()> {
        self.call(|reply| Command::ReleaseCores { cores, reply })
            .await?
    }

    /// Move a core to the next higher admissible frequency
    ///
    /// `Ok(false)` when there is no higher frequency or the processor
    /// rejects it.
    pub async fn increase_frequency(&self, core_no: usize, processor: ProcessorId) -> Result<bool> {
        self.step(core_no, processor, Step::Up).await
    }

    /// Move a core to the next lower admissible frequency
    pub async fn decrease_frequency(&self, core_no: usize, processor: ProcessorId) -> Result<bool> {
        self.step(core_no, processor, Step::Down).await
    }

    /// Processor layout
    pub async fn static_state(&self) -> Result<ComputerStaticState> {
        self.call(|reply| Command::StaticState { reply }).await
    }

    /// Reservation and frequency tables
    pub async fn dynamic_state(&self) -> Result<ComputerDynamicState> {
        self.call(|reply| Command::DynamicState { reply }).await
    }

    /// Stop the computer and its processors
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    async fn step(&self, core: usize, processor: ProcessorId, step: Step) -> Result<bool> {
        self.call(|reply| Command::StepFrequency {
            core,
            processor,
            step,
            reply,
        })
        .await?
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| HwError::Disconnected(self.id.to_string()))?;
        rx.await.map_err(|_| HwError::Disconnected(self.id.to_string()))
    }
}

struct ComputerActor {
    id: ComputerId,
    specs: Vec<ProcessorSpec>,
    processors: Arc<[ProcessorHandle]>,
    table: ReservationTable,
    clock: SharedClock,
}

impl ComputerActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::AllocateCore { reply } => {
                    let _ = reply.send(self.allocate());
                }
                Command::AllocateCores { count, reply } => {
                    let cores: Vec<_> = (0..count).map_while(|_| self.allocate()).collect();
                    if cores.len() < count {
                        debug!(
                            computer = %self.id,
                            requested = count,
                            granted = cores.len(),
                            "Short core grant"
                        );
                    }
                    let _ = reply.send(cores);
                }
                Command::ReleaseCores { cores, reply } => {
                    let _ = reply.send(self.release(cores));
                }
                Command::StepFrequency {
                    core,
                    processor,
                    step,
                    reply,
                } => {
                    let _ = reply.send(self.step_frequency(core, processor, step).await);
                }
                Command::StaticState { reply } => {
                    let _ = reply.send(ComputerStaticState {
                        id: self.id,
                        processors: self.specs.iter().map(|p| p.id).collect(),
                        cores_per_processor: self.specs.iter().map(|p| p.cores).collect(),
                    });
                }
                Command::DynamicState { reply } => {
                    let _ = reply.send(ComputerDynamicState {
                        id: self.id,
                        timestamp: self.clock.now(),
                        reserved: self.table.reserved().to_vec(),
                        frequencies: self.table.frequencies().to_vec(),
                    });
                }
                Command::Shutdown => break,
            }
        }

        for processor in self.processors.iter() {
            processor.shutdown();
        }
        debug!(computer = %self.id, reserved = self.table.reserved_count(), "Computer stopped");
    }

    fn allocate(&mut self) -> Option<AllocatedCore> {
        let (processor_index, core_no) = self.table.allocate()?;
        let frequency = self
            .table
            .frequency(processor_index, core_no)
            .unwrap_or(self.specs[processor_index].default_frequency);
        let processor = self.processors[processor_index].clone();
        debug!(computer = %self.id, processor = %processor.id(), core = core_no, "Core reserved");
        Some(AllocatedCore {
            computer_id: self.id,
            processor_index,
            processor_id: processor.id(),
            core_no,
            frequency,
            processor,
        })
    }

    fn release(&mut self, cores: Vec<AllocatedCore>) -> Result<()> {
        let mut first_error = None;
        for core in cores {
            let outcome = if core.computer_id != self.id {
                Err(HwError::ForeignCore {
                    computer: self.id,
                    owner: core.computer_id,
                })
            } else if self.table.release(core.processor_index, core.core_no) {
                debug!(computer = %self.id, processor = %core.processor_id, core = core.core_no, "Core released");
                Ok(())
            } else {
                Err(HwError::CoreNotReserved {
                    computer: self.id,
                    processor_index: core.processor_index,
                    core: core.core_no,
                })
            };
            if let Err(e) = outcome {
                error!(computer = %self.id, core = %core, error = %e, "Invariant violation on release");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn step_frequency(&mut self, core: usize, processor: ProcessorId, step: Step) -> Result<bool> {
        let index = self
            .specs
            .iter()
            .position(|p| p.id == processor)
            .ok_or(HwError::UnknownProcessor {
                computer: self.id,
                processor,
            })?;
        if self.table.frequency(index, core).is_none() {
            return Err(HwError::InvalidCore { processor, core });
        }
        // Cores can be retuned through their processor handle directly
        let current = self.processors[index].core_frequency(core).await?;
        self.table.set_frequency(index, core, current);

        let spec = &self.specs[index];
        let candidate = match step {
            Step::Up => spec.next_higher(current),
            Step::Down => spec.next_lower(current),
        };
        let Some(target) = candidate else {
            debug!(computer = %self.id, %processor, core, %current, ?step, "No neighbouring frequency");
            return Ok(false);
        };

        match self.processors[index].set_core_frequency(core, target).await {
            Ok(()) => {
                self.table.set_frequency(index, core, target);
                debug!(computer = %self.id, %processor, core, from = %current, to = %target, "Frequency stepped");
                Ok(true)
            }
            Err(HwError::UnacceptableFrequency { .. }) => {
                warn!(computer = %self.id, %processor, core, %target, "Frequency step would break the max gap");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
