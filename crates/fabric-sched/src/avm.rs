//! Application VM: reserved cores plus a FIFO task queue
//!
//! Each accepted request becomes a [`Task`] with a fresh id and waits in the
//! queue until a core of the VM is idle. Exactly one task is started per
//! triggering event (a submission, a completion, or a core allocation), even
//! when several cores are idle and several tasks are queued.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use fabric_hw::{
    AllocatedCore, Clock, ProcessorId, Request, SharedClock, Task, TaskCompletionSink, TaskId,
};

use crate::notify::{RequestNotificationSink, RequestSubmission};
use crate::types::AvmId;
use crate::{Result, SchedError};

/// Counters and queue sizes of an application VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvmState {
    /// VM id
    pub id: AvmId,
    /// Cores held
    pub cores: usize,
    /// Cores currently idle
    pub idle_cores: usize,
    /// Distinct processors the VM drives
    pub linked_processors: usize,
    /// Tasks waiting for a core
    pub queued: usize,
    /// Tasks executing
    pub running: usize,
    /// Requests accepted since start
    pub accepted: u64,
    /// Tasks completed since start
    pub completed: u64,
    /// Task starts refused by a processor
    pub failed_starts: u64,
    /// Requests dropped because the VM was draining
    pub dropped: u64,
    /// True once the VM stopped taking work
    pub draining: bool,
    /// Termination notifications that could not be delivered
    pub failed_notifications: u64,
}

enum Command {
    AllocateCores {
        cores: Vec<AllocatedCore>,
        reply: oneshot::Sender<Result<()>>,
    },
    Submit {
        request: Request,
        notify: bool,
    },
    State {
        reply: oneshot::Sender<AvmState>,
    },
    Drain {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cloneable entry point to a running application VM
#[derive(Debug, Clone)]
pub struct AvmHandle {
    id: AvmId,
    tx: mpsc::UnboundedSender<Command>,
}

impl AvmHandle {
    /// Start an application VM with no cores
    ///
    /// Terminations of requests submitted with notification are reported to
    /// `notify`.
    pub fn spawn(
        id: AvmId,
        clock: SharedClock,
        notify: Option<Arc<dyn RequestNotificationSink>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel::<Task>();

        let actor = AvmActor {
            id,
            clock,
            notify,
            completion_sink: Arc::new(completion_tx),
            cores: Vec::new(),
            linked: HashSet::new(),
            queue: VecDeque::new(),
            running: HashMap::new(),
            notify_set: HashSet::new(),
            draining: false,
            drained: Vec::new(),
            accepted: 0,
            completed: 0,
            failed_starts: 0,
            dropped: 0,
            failed_notifications: 0,
        };
        tokio::spawn(actor.run(rx, completion_rx));
        debug!(avm = %id, "Application VM started");

        Self { id, tx }
    }

    /// VM id
    #[inline]
    #[must_use]
    pub fn id(&self) -> AvmId {
        self.id
    }

    /// Hand reserved cores to the VM
    ///
    /// Fails with [`SchedError::EmptyAllocation`] when `cores` is empty.
    pub async fn allocate_cores(&self, cores: Vec<AllocatedCore>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AllocateCores { cores, reply })?;
        rx.await.map_err(|_| self.disconnected())?
    }

    /// Queue and counter snapshot
    pub async fn state(&self) -> Result<AvmState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::State { reply })?;
        rx.await.map_err(|_| self.disconnected())
    }

    /// Stop taking work and wait until no task of the VM runs on a processor
    ///
    /// Queued tasks and later submissions are dropped. The VM keeps its cores
    /// and stays up, so completions are still reported.
    pub async fn drain(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Drain { reply })?;
        rx.await.map_err(|_| self.disconnected())
    }

    /// Stop the VM; queued tasks are dropped and running ones are no longer tracked
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

impl RequestSubmission for AvmHandle {
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

#[derive(Debug)]
struct CoreSlot {
    core: AllocatedCore,
    idle: bool,
}

struct AvmActor {
    id: AvmId,
    clock: SharedClock,
    notify: Option<Arc<dyn RequestNotificationSink>>,
    completion_sink: Arc<dyn TaskCompletionSink>,
    cores: Vec<CoreSlot>,
    linked: HashSet<ProcessorId>,
    queue: VecDeque<Task>,
    running: HashMap<TaskId, usize>,
    notify_set: HashSet<TaskId>,
    draining: bool,
    drained: Vec<oneshot::Sender<()>>,
    accepted: u64,
    completed: u64,
    failed_starts: u64,
    dropped: u64,
    failed_notifications: u64,
}

impl AvmActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Task>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::AllocateCores { cores, reply }) => {
                        let result = self.allocate_cores(cores);
                        let start = result.is_ok();
                        let _ = reply.send(result);
                        if start {
                            self.start_task().await;
                        }
                    }
                    Some(Command::Submit { request, notify }) => self.accept(request, notify).await,
                    Some(Command::State { reply }) => {
                        let _ = reply.send(self.state());
                    }
                    Some(Command::Drain { reply }) => self.drain(reply),
                    Some(Command::Shutdown) | None => break,
                },
                Some(task) = completions.recv() => self.end_of_task(task).await,
            }
        }

        debug!(
            avm = %self.id,
            queued = self.queue.len(),
            running = self.running.len(),
            completed = self.completed,
            "Application VM stopped"
        );
    }

    fn allocate_cores(&mut self, cores: Vec<AllocatedCore>) -> Result<()> {
        if cores.is_empty() {
            return Err(SchedError::EmptyAllocation(self.id));
        }
        for core in cores {
            if self.cores.iter().any(|slot| slot.core == core) {
                warn!(avm = %self.id, core = %core, "Core already held");
                continue;
            }
            if self.linked.insert(core.processor_id) {
                debug!(avm = %self.id, processor = %core.processor_id, "Processor linked");
            }
            self.cores.push(CoreSlot { core, idle: true });
        }
        info!(avm = %self.id, cores = self.cores.len(), "Cores allocated");
        Ok(())
    }

    async fn accept(&mut self, request: Request, notify: bool) {
        if self.draining {
            self.dropped += 1;
            warn!(avm = %self.id, uri = %request.uri, "Request dropped, VM is draining");
            return;
        }
        let task = Task::new(request);
        debug!(avm = %self.id, task = %task.id, uri = %task.request.uri, notify, "Request accepted");
        if notify {
            self.notify_set.insert(task.id);
        }
        self.queue.push_back(task);
        self.accepted += 1;
        self.start_task().await;
    }

    /// Start the oldest queued task on one idle core, if both exist
    async fn start_task(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let Some(slot) = self.cores.iter().position(|slot| slot.idle) else {
            return;
        };
        let Some(task) = self.queue.pop_front() else {
            return;
        };

        self.cores[slot].idle = false;
        self.running.insert(task.id, slot);
        let core = &self.cores[slot].core;
        let processor = core.processor.clone();
        let core_no = core.core_no;

        match processor
            .execute_task_on_core_and_notify(core_no, task.clone(), self.completion_sink.clone())
            .await
        {
            Ok(()) => {
                debug!(avm = %self.id, task = %task.id, processor = %processor.id(), core = core_no, at = %self.clock.now(), "Task dispatched");
            }
            Err(e) => {
                self.failed_starts += 1;
                error!(avm = %self.id, task = %task.id, processor = %processor.id(), core = core_no, error = %e, "Task start refused");
                self.running.remove(&task.id);
                self.cores[slot].idle = true;
                self.queue.push_front(task);
            }
        }
    }

    async fn end_of_task(&mut self, task: Task) {
        let Some(slot) = self.running.remove(&task.id) else {
            let e = SchedError::UnknownTask(task.id);
            error!(avm = %self.id, error = %e, "Completion for a task that is not running");
            return;
        };
        self.cores[slot].idle = true;
        self.completed += 1;
        debug!(avm = %self.id, task = %task.id, "Task finished");

        if self.notify_set.remove(&task.id) {
            self.notify_termination(task.request);
        }
        if !self.queue.is_empty() {
            self.start_task().await;
        }
        if self.draining && self.running.is_empty() {
            self.finish_drain();
        }
    }

    fn drain(&mut self, reply: oneshot::Sender<()>) {
        if !self.draining {
            self.draining = true;
            self.dropped += self.queue.len() as u64;
            for task in self.queue.drain(..) {
                self.notify_set.remove(&task.id);
            }
            info!(avm = %self.id, running = self.running.len(), "Draining");
        }
        self.drained.push(reply);
        if self.running.is_empty() {
            self.finish_drain();
        }
    }

    fn finish_drain(&mut self) {
        debug!(avm = %self.id, completed = self.completed, "Drained");
        for reply in self.drained.drain(..) {
            let _ = reply.send(());
        }
    }

    fn notify_termination(&mut self, request: Request) {
        let Some(sink) = &self.notify else {
            warn!(avm = %self.id, uri = %request.uri, "No notification address for terminated request");
            return;
        };
        let uri = request.uri.clone();
        if let Err(e) = sink.notify_request_termination(request) {
            self.failed_notifications += 1;
            error!(avm = %self.id, %uri, error = %e, "Termination notification failed");
        }
    }

    fn state(&self) -> AvmState {
        AvmState {
            id: self.id,
            cores: self.cores.len(),
            idle_cores: self.cores.iter().filter(|slot| slot.idle).count(),
            linked_processors: self.linked.len(),
            queued: self.queue.len(),
            running: self.running.len(),
            accepted: self.accepted,
            completed: self.completed,
            failed_starts: self.failed_starts,
            dropped: self.dropped,
            draining: self.draining,
            failed_notifications: self.failed_notifications,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_hw::{
        AcceleratedClock, ComputerHandle, ComputerId, ComputerSpec, Frequency, FrequencyLevel,
        ProcessorSpec, SimDuration,
    };

    fn computer(clock: &SharedClock, cores: usize) -> ComputerHandle {
        let processor = ProcessorSpec::new(
            ProcessorId(0),
            cores,
            [FrequencyLevel::new(Frequency::new(1500), 1.5e6)],
            Frequency::new(1500),
            0,
        );
        ComputerHandle::spawn(ComputerSpec::new(ComputerId(0), vec![processor]), clock.clone())
            .unwrap()
    }

    /// Ten simulated seconds of work at 1500MHz
    fn request(uri: &str) -> Request {
        Request::new(uri, 15_000_000)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_task_started_per_event() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let computer = computer(&clock, 2);
        let avm = AvmHandle::spawn(AvmId(1), clock.clone(), None);

        for i in 0..3 {
            avm.submit_request(request(&format!("r{i}"))).unwrap();
        }
        let state = avm.state().await.unwrap();
        assert_eq!((state.queued, state.running), (3, 0));

        let cores = computer.allocate_cores(2).await.unwrap();
        avm.allocate_cores(cores).await.unwrap();

        // The allocation is a single event, so only one of the two idle cores is used
        let state = avm.state().await.unwrap();
        assert_eq!((state.queued, state.running, state.idle_cores), (2, 1, 1));
        assert_eq!(state.linked_processors, 1);

        clock.sleep(SimDuration::from_secs_f64(15.0)).await;
        let state = avm.state().await.unwrap();
        assert_eq!(state.completed, 1);
        assert_eq!((state.queued, state.running), (1, 1));

        clock.sleep(SimDuration::from_secs_f64(50.0)).await;
        let state = avm.state().await.unwrap();
        assert_eq!(state.completed, 3);
        assert_eq!((state.queued, state.running, state.idle_cores), (0, 0, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submissions_fill_idle_cores() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let computer = computer(&clock, 2);
        let avm = AvmHandle::spawn(AvmId(1), clock.clone(), None);
        avm.allocate_cores(computer.allocate_cores(2).await.unwrap())
            .await
            .unwrap();

        for i in 0..3 {
            avm.submit_request(request(&format!("r{i}"))).unwrap();
        }
        let state = avm.state().await.unwrap();
        assert_eq!((state.queued, state.running, state.idle_cores), (1, 2, 0));
        assert_eq!(state.accepted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_notify_submissions_are_reported() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let computer = computer(&clock, 2);
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
        let avm = AvmHandle::spawn(AvmId(1), clock.clone(), Some(Arc::new(tx)));
        avm.allocate_cores(computer.allocate_cores(2).await.unwrap())
            .await
            .unwrap();

        avm.submit_request(request("quiet")).unwrap();
        avm.submit_request_and_notify(request("loud")).unwrap();

        let terminated = rx.recv().await.unwrap();
        assert_eq!(terminated.uri, "loud");

        clock.sleep(SimDuration::from_secs_f64(50.0)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(avm.state().await.unwrap().completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_notification_is_counted() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let computer = computer(&clock, 1);
        let (tx, rx) = mpsc::unbounded_channel::<Request>();
        drop(rx);
        let avm = AvmHandle::spawn(AvmId(1), clock.clone(), Some(Arc::new(tx)));
        avm.allocate_cores(computer.allocate_cores(1).await.unwrap())
            .await
            .unwrap();

        avm.submit_request_and_notify(request("lost")).unwrap();
        clock.sleep(SimDuration::from_secs_f64(20.0)).await;

        let state = avm.state().await.unwrap();
        assert_eq!(state.completed, 1);
        assert_eq!(state.failed_notifications, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_running_task() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let computer = computer(&clock, 1);
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
        let avm = AvmHandle::spawn(AvmId(1), clock.clone(), Some(Arc::new(tx)));
        avm.allocate_cores(computer.allocate_cores(1).await.unwrap())
            .await
            .unwrap();

        avm.submit_request_and_notify(request("running")).unwrap();
        avm.submit_request_and_notify(request("queued")).unwrap();
        let started = clock.now();
        avm.drain().await.unwrap();

        // Drain returned only once the running task finished and was reported
        assert!(clock.now().saturating_duration_since(started).as_secs_f64() > 9.0);
        assert_eq!(rx.recv().await.unwrap().uri, "running");
        avm.submit_request(request("late")).unwrap();

        let state = avm.state().await.unwrap();
        assert!(state.draining);
        assert_eq!((state.running, state.queued), (0, 0));
        assert_eq!(state.completed, 1);
        assert_eq!(state.dropped, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_allocation_is_rejected() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let avm = AvmHandle::spawn(AvmId(7), clock, None);

        let err = avm.allocate_cores(Vec::new()).await.unwrap_err();
        assert!(matches!(err, SchedError::EmptyAllocation(AvmId(7))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let avm = AvmHandle::spawn(AvmId(1), clock, None);
        avm.shutdown();

        assert!(matches!(
            avm.state().await.unwrap_err(),
            SchedError::Disconnected(_)
        ));
        assert!(avm.submit_request(request("late")).is_err());
    }
}
