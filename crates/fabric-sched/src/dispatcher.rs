//! Request dispatcher: least-recently-used routing across application VMs
//!
//! Every request is forwarded to the VM whose last use is oldest, ties going
//! to the VM registered first. The VM always reports the termination back so
//! the dispatcher can feed the execution time into its moving average; the
//! termination is passed on to the original requester only for requests
//! submitted with notification.
//!
//! Last-use stamps come from a logical counter rather than the clock, so two
//! requests dispatched at the same simulated instant still alternate.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use fabric_hw::{Clock, Request, SharedClock, SimDuration, SimInstant};

use crate::ema::ExponentialMovingAverage;
use crate::notify::{RequestNotificationSink, RequestSubmission};
use crate::types::DispatcherId;
use crate::{Result, SchedError};

/// Dispatcher counters and execution-time statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Dispatcher id
    pub id: DispatcherId,
    /// Registered VMs
    pub vms: usize,
    /// Requests forwarded to a VM
    pub forwarded: u64,
    /// Requests dropped for lack of a VM
    pub dropped: u64,
    /// Terminations received
    pub completed: u64,
    /// Requests forwarded and not yet terminated
    pub in_flight: usize,
    /// Execution-time samples in the average
    pub samples: u64,
    /// Moving average of execution time, in simulated seconds
    pub average_execution_time: f64,
    /// Terminations that could not be passed on to the requester
    pub failed_notifications: u64,
}

enum Command {
    RegisterVms {
        vms: Vec<Arc<dyn RequestSubmission>>,
        reply: oneshot::Sender<usize>,
    },
    Submit {
        request: Request,
        notify: bool,
    },
    Terminated {
        request: Request,
    },
    ExecutionTime {
        uri: String,
        reply: oneshot::Sender<Option<SimDuration>>,
    },
    Stats {
        reply: oneshot::Sender<DispatcherStats>,
    },
    Shutdown,
}

/// Cloneable entry point to a running dispatcher
///
/// Implements [`RequestSubmission`] for requesters and
/// [`RequestNotificationSink`] for the VMs behind it.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    id: DispatcherId,
    tx: mpsc::UnboundedSender<Command>,
}

impl DispatcherHandle {
    /// Start a dispatcher with no VMs
    ///
    /// Terminations of requests submitted with notification are passed on to
    /// `requester`.
    pub fn spawn(
        id: DispatcherId,
        clock: SharedClock,
        requester: Option<Arc<dyn RequestNotificationSink>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = DispatcherActor {
            id,
            clock,
            requester,
            vms: Vec::new(),
            last_used: Vec::new(),
            tick: 0,
            start_times: HashMap::new(),
            execution_times: HashMap::new(),
            forward_termination: HashSet::new(),
            ema: ExponentialMovingAverage::new(),
            forwarded: 0,
            dropped: 0,
            completed: 0,
            failed_notifications: 0,
        };
        tokio::spawn(actor.run(rx));
        debug!(dispatcher = %id, "Dispatcher started");
        Self { id, tx }
    }

    /// Dispatcher id
    #[inline]
    #[must_use]
    pub fn id(&self) -> DispatcherId {
        self.id
    }

    /// Append VMs to the routing list; returns the new VM count
    pub async fn register_vms(&self, vms: Vec<Arc<dyn RequestSubmission>>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RegisterVms { vms, reply })?;
        rx.await.map_err(|_| self.disconnected())
    }

    /// Last measured execution time of a request
    pub async fn execution_time(&self, uri: impl Into<String>) -> Result<Option<SimDuration>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ExecutionTime {
            uri: uri.into(),
            reply,
        })?;
        rx.await.map_err(|_| self.disconnected())
    }

    /// Counters and moving average
    pub async fn stats(&self) -> Result<DispatcherStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| self.disconnected())
    }

    /// Stop the dispatcher
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| self.disconnected())
    }

    fn disconnected(&self) -> SchedError {
        SchedError::Disconnected(self.id.to_string())
    }
}

impl RequestSubmission for DispatcherHandle {
    fn submit_request(&self, request: Request) -> Result<()> {
        self.send(Command::Submit {
            request,
            notify: false,
        })
    }

    fn submit_request_and_notify(&self, request: Request) -> Result<()> {
        self.send(Command::Submit {
            request,
            notify: true,
        })
    }
}

impl RequestNotificationSink for DispatcherHandle {
    fn notify_request_termination(&self, request: Request) -> Result<()> {
        self.send(Command::Terminated { request })
    }
}

struct DispatcherActor {
    id: DispatcherId,
    clock: SharedClock,
    requester: Option<Arc<dyn RequestNotificationSink>>,
    vms: Vec<Arc<dyn RequestSubmission>>,
    last_used: Vec<u64>,
    tick: u64,
    start_times: HashMap<String, SimInstant>,
    execution_times: HashMap<String, SimDuration>,
    forward_termination: HashSet<String>,
    ema: ExponentialMovingAverage,
    forwarded: u64,
    dropped: u64,
    completed: u64,
    failed_notifications: u64,
}

impl DispatcherActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::RegisterVms { vms, reply } => {
                    self.last_used.extend(std::iter::repeat_n(0, vms.len()));
                    self.vms.extend(vms);
                    info!(dispatcher = %self.id, vms = self.vms.len(), "VMs registered");
                    let _ = reply.send(self.vms.len());
                }
                Command::Submit { request, notify } => self.dispatch(request, notify),
                Command::Terminated { request } => self.terminated(request),
                Command::ExecutionTime { uri, reply } => {
                    let _ = reply.send(self.execution_times.get(&uri).copied());
                }
                Command::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                Command::Shutdown => break,
            }
        }
        debug!(dispatcher = %self.id, forwarded = self.forwarded, dropped = self.dropped, "Dispatcher stopped");
    }

    /// Index of the VM used least recently, first one on ties
    fn least_used_vm(&self) -> Option<usize> {
        self.last_used
            .iter()
            .enumerate()
            .min_by_key(|(_, stamp)| **stamp)
            .map(|(index, _)| index)
    }

    fn dispatch(&mut self, request: Request, notify: bool) {
        let Some(index) = self.least_used_vm() else {
            self.dropped += 1;
            error!(dispatcher = %self.id, uri = %request.uri, "No VM available, request dropped");
            return;
        };
        self.tick += 1;
        self.last_used[index] = self.tick;

        let uri = request.uri.clone();
        self.start_times.insert(uri.clone(), self.clock.now());
        if notify {
            self.forward_termination.insert(uri.clone());
        }

        match self.vms[index].submit_request_and_notify(request) {
            Ok(()) => {
                self.forwarded += 1;
                debug!(dispatcher = %self.id, %uri, vm = index, "Request forwarded");
            }
            Err(e) => {
                self.dropped += 1;
                self.start_times.remove(&uri);
                self.forward_termination.remove(&uri);
                error!(dispatcher = %self.id, %uri, vm = index, error = %e, "Request dropped");
            }
        }
    }

    fn terminated(&mut self, request: Request) {
        self.completed += 1;
        match self.start_times.remove(&request.uri) {
            Some(start) => {
                let elapsed = self.clock.now().saturating_duration_since(start);
                let average = self.ema.update(elapsed.as_secs_f64());
                debug!(dispatcher = %self.id, uri = %request.uri, %elapsed, average, "Request terminated");
                self.execution_times.insert(request.uri.clone(), elapsed);
            }
            None => {
                warn!(dispatcher = %self.id, uri = %request.uri, "Termination of an unknown request");
            }
        }

        if !self.forward_termination.remove(&request.uri) {
            return;
        }
        let Some(requester) = &self.requester else {
            warn!(dispatcher = %self.id, uri = %request.uri, "No requester to notify");
            return;
        };
        let uri = request.uri.clone();
        if let Err(e) = requester.notify_request_termination(request) {
            self.failed_notifications += 1;
            error!(dispatcher = %self.id, %uri, error = %e, "Termination notification failed");
        }
    }

    fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            id: self.id,
            vms: self.vms.len(),
            forwarded: self.forwarded,
            dropped: self.dropped,
            completed: self.completed,
            in_flight: self.start_times.len(),
            samples: self.ema.samples(),
            average_execution_time: self.ema.value(),
            failed_notifications: self.failed_notifications,
        }
    }
}
