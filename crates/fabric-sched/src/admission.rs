//! Admission controller: all-or-nothing core reservation and deployment
//!
//! An application asks for `number_of_avms` VMs of `cores_per_avm` cores
//! each. For every VM the computer pool is scanned in order and the first
//! computer that can grant all of that VM's cores in one call is used, so a
//! single VM never spans computers. Surplus from a short grant is released
//! immediately. If any VM cannot be placed, every core reserved so far is
//! released and the demand is rejected: after a rejection the admission holds
//! no cores at all.
//!
//! Admission decisions run one at a time on the controller's own task, so
//! two concurrent demands can never race for the same core.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use fabric_hw::{AllocatedCore, ComputerHandle, SharedClock};

use crate::avm::AvmHandle;
use crate::dispatcher::DispatcherHandle;
use crate::notify::{RequestNotificationSink, RequestSubmission};
use crate::types::{AvmId, DispatcherId};
use crate::{Result, SchedError};

/// Capacity request for a new application
#[derive(Debug, Clone)]
pub struct ApplicationDemand {
    /// Application URI
    pub app_uri: String,
    /// Number of application VMs
    pub number_of_avms: usize,
    /// Cores reserved for each VM, all on one computer
    pub cores_per_avm: usize,
    /// Receiver of request terminations for requests submitted with notification
    pub requester: Option<Arc<dyn RequestNotificationSink>>,
}

impl ApplicationDemand {
    /// Demand without a termination receiver
    pub fn new(app_uri: impl Into<String>, number_of_avms: usize, cores_per_avm: usize) -> Self {
        Self {
            app_uri: app_uri.into(),
            number_of_avms,
            cores_per_avm,
            requester: None,
        }
    }

    /// Route request terminations to `requester`
    #[must_use]
    pub fn with_requester(mut self, requester: Arc<dyn RequestNotificationSink>) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Cores held once admitted
    #[must_use]
    pub fn total_cores(&self) -> usize {
        self.number_of_avms * self.cores_per_avm
    }

    /// Zero VMs or zero cores per VM cannot describe an application
    pub fn validate(&self) -> Result<()> {
        if self.number_of_avms == 0 || self.cores_per_avm == 0 {
            return Err(SchedError::InvalidDemand(format!(
                "{} asks for {} VMs of {} cores",
                self.app_uri, self.number_of_avms, self.cores_per_avm
            )));
        }
        Ok(())
    }
}

/// Why a demand was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// Not every VM could be placed on a single computer
    InsufficientCores {
        /// VMs asked for
        requested_avms: usize,
        /// VMs that could be placed before the shortfall
        placed_avms: usize,
    },
    /// The configured number of concurrent applications is reached
    ApplicationLimit {
        /// Configured cap
        limit: usize,
    },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientCores {
                requested_avms,
                placed_avms,
            } => write!(f, "only {placed_avms} of {requested_avms} VMs could be placed"),
            Self::ApplicationLimit { limit } => {
                write!(f, "limit of {limit} applications reached")
            }
        }
    }
}

/// An admitted application
#[derive(Debug, Clone)]
pub struct DeployedApplication {
    /// Application URI
    pub app_uri: String,
    /// Key of the deployment, used to terminate it
    pub dispatcher_id: DispatcherId,
    /// Submission endpoint of the application
    pub dispatcher: DispatcherHandle,
    /// The application's VMs
    pub avms: Vec<AvmHandle>,
}

/// Outcome of an admission request
#[derive(Debug, Clone)]
pub enum Admission {
    /// Cores reserved and components deployed
    Accepted(DeployedApplication),
    /// Nothing reserved, nothing deployed
    Rejected(RejectionReason),
}

impl Admission {
    /// True for [`Admission::Accepted`]
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// The deployed application, if accepted
    #[must_use]
    pub fn into_deployed(self) -> Option<DeployedApplication> {
        match self {
            Self::Accepted(app) => Some(app),
            Self::Rejected(_) => None,
        }
    }
}

/// Admission controller counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionState {
    /// Computers in the pool
    pub computers: usize,
    /// Applications currently deployed
    pub applications: usize,
    /// Cores held by deployed applications
    pub reserved_cores: usize,
    /// Demands accepted since start
    pub accepted: u64,
    /// Demands rejected since start
    pub rejected: u64,
    /// Applications terminated since start
    pub terminated: u64,
}

enum Command {
    Submit {
        demand: ApplicationDemand,
        reply: oneshot::Sender<Result<Admission>>,
    },
    Terminate {
        dispatcher: DispatcherId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Sent back by a teardown once the application's VMs are drained
    Drained {
        dispatcher: DispatcherId,
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<AdmissionState>,
    },
    Shutdown,
}

/// Cloneable entry point to a running admission controller
#[derive(Debug, Clone)]
pub struct AdmissionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl AdmissionHandle {
    /// Start an admission controller over `computers`, scanned in this order
    ///
    /// `max_applications` caps concurrent deployments; 0 means unlimited.
    pub fn spawn(
        computers: Vec<ComputerHandle>,
        clock: SharedClock,
        max_applications: usize,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        info!(
            computers = computers.len(),
            max_applications, "Admission controller started"
        );
        let actor = AdmissionActor {
            mailbox: tx.downgrade(),
            computers,
            clock,
            max_applications,
            deployments: HashMap::new(),
            next_dispatcher: 1,
            next_avm: 1,
            accepted: 0,
            rejected: 0,
            terminated: 0,
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Reserve capacity for an application and deploy it, or reject it whole
    ///
    /// Capacity shortfall is an [`Admission::Rejected`] outcome, not an error.
    pub async fn submit_application(&self, demand: ApplicationDemand) -> Result<Admission> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit { demand, reply })?;
        rx.await.map_err(|_| disconnected())?
    }

    /// Drain a deployed application, release every core and stop its components
    ///
    /// Returns once in-flight tasks have finished and the cores are free.
    /// Other admission requests are served meanwhile; the draining
    /// application's cores stay reserved until then.
    pub async fn terminate_application(&self, dispatcher: DispatcherId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Terminate { dispatcher, reply })?;
        rx.await.map_err(|_| disconnected())?
    }

    /// Counter snapshot
    pub async fn state(&self) -> Result<AdmissionState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::State { reply })?;
        rx.await.map_err(|_| disconnected())
    }

    /// Stop the controller; deployed applications keep running
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| disconnected())
    }
}

fn disconnected() -> SchedError {
    SchedError::Disconnected("admission controller".to_string())
}

/// Cores granted by one computer for one VM
#[derive(Debug)]
struct AllocationRecord {
    computer: usize,
    cores: Vec<AllocatedCore>,
}

struct Deployment {
    app_uri: String,
    records: Vec<AllocationRecord>,
    dispatcher: DispatcherHandle,
    avms: Vec<AvmHandle>,
    terminating: bool,
}

struct AdmissionActor {
    mailbox: mpsc::WeakUnboundedSender<Command>,
    computers: Vec<ComputerHandle>,
    clock: SharedClock,
    max_applications: usize,
    deployments: HashMap<DispatcherId, Deployment>,
    next_dispatcher: u64,
    next_avm: u64,
    accepted: u64,
    rejected: u64,
    terminated: u64,
}

impl AdmissionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Submit { demand, reply } => {
                    let _ = reply.send(self.admit(demand).await);
                }
                Command::Terminate { dispatcher, reply } => self.terminate(dispatcher, reply),
                Command::Drained { dispatcher, reply } => {
                    let _ = reply.send(self.release_drained(dispatcher).await);
                }
                Command::State { reply } => {
                    let _ = reply.send(self.state());
                }
                Command::Shutdown => break,
            }
        }
        debug!(
            applications = self.deployments.len(),
            "Admission controller stopped"
        );
    }

    async fn admit(&mut self, demand: ApplicationDemand) -> Result<Admission> {
        demand.validate()?;

        // Draining applications count until their cores are free
        if self.max_applications > 0 && self.deployments.len() >= self.max_applications {
            self.rejected += 1;
            let reason = RejectionReason::ApplicationLimit {
                limit: self.max_applications,
            };
            warn!(app = %demand.app_uri, %reason, "Application rejected");
            return Ok(Admission::Rejected(reason));
        }

        let records = match self.allocate(&demand).await? {
            Ok(records) => records,
            Err(placed_avms) => {
                self.rejected += 1;
                let reason = RejectionReason::InsufficientCores {
                    requested_avms: demand.number_of_avms,
                    placed_avms,
                };
                warn!(app = %demand.app_uri, %reason, "Application rejected");
                return Ok(Admission::Rejected(reason));
            }
        };

        match self.deploy(&demand, &records).await {
            Ok((dispatcher, avms)) => {
                let app = DeployedApplication {
                    app_uri: demand.app_uri.clone(),
                    dispatcher_id: dispatcher.id(),
                    dispatcher: dispatcher.clone(),
                    avms: avms.clone(),
                };
                self.deployments.insert(
                    dispatcher.id(),
                    Deployment {
                        app_uri: demand.app_uri,
                        records,
                        dispatcher,
                        avms,
                        terminating: false,
                    },
                );
                self.accepted += 1;
                info!(
                    app = %app.app_uri,
                    dispatcher = %app.dispatcher_id,
                    avms = app.avms.len(),
                    cores = demand.number_of_avms * demand.cores_per_avm,
                    "Application admitted"
                );
                Ok(Admission::Accepted(app))
            }
            Err(e) => {
                error!(app = %demand.app_uri, error = %e, "Deployment failed, rolling back");
                if let Err(release) = self.release(records).await {
                    error!(app = %demand.app_uri, error = %release, "Rollback incomplete");
                }
                Err(e)
            }
        }
    }

    /// Reserve every VM's cores, or none
    ///
    /// `Ok(Err(placed))` reports a shortfall after `placed` VMs, with every
    /// reservation already rolled back.
    async fn allocate(
        &self,
        demand: &ApplicationDemand,
    ) -> Result<std::result::Result<Vec<AllocationRecord>, usize>> {
        let mut records = Vec::with_capacity(demand.number_of_avms);
        for _ in 0..demand.number_of_avms {
            let placed = match self.allocate_one(demand.cores_per_avm).await {
                Ok(placed) => placed,
                Err(e) => {
                    self.rollback(&demand.app_uri, records).await;
                    return Err(e);
                }
            };
            match placed {
                Some(record) => records.push(record),
                None => {
                    let placed_avms = records.len();
                    self.rollback(&demand.app_uri, records).await;
                    return Ok(Err(placed_avms));
                }
            }
        }
        Ok(Ok(records))
    }

    /// Cores for one VM from the first computer able to grant them all
    async fn allocate_one(&self, count: usize) -> Result<Option<AllocationRecord>> {
        for (index, computer) in self.computers.iter().enumerate() {
            let cores = computer.allocate_cores(count).await?;
            if cores.len() == count {
                return Ok(Some(AllocationRecord {
                    computer: index,
                    cores,
                }));
            }
            if !cores.is_empty() {
                debug!(computer = %computer.id(), granted = cores.len(), requested = count, "Releasing short grant");
                computer.release_cores(cores).await?;
            }
        }
        Ok(None)
    }

    async fn rollback(&self, app_uri: &str, records: Vec<AllocationRecord>) {
        let cores: usize = records.iter().map(|r| r.cores.len()).sum();
        debug!(app = %app_uri, cores, "Rolling back reservations");
        if let Err(e) = self.release(records).await {
            error!(app = %app_uri, error = %e, "Rollback incomplete");
        }
    }

    /// Release every record, returning the first failure
    async fn release(&self, records: Vec<AllocationRecord>) -> Result<()> {
        let mut first_error = None;
        for record in records {
            let computer = &self.computers[record.computer];
            if let Err(e) = computer.release_cores(record.cores).await {
                first_error.get_or_insert(SchedError::from(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn deploy(
        &mut self,
        demand: &ApplicationDemand,
        records: &[AllocationRecord],
    ) -> Result<(DispatcherHandle, Vec<AvmHandle>)> {
        let id = DispatcherId(self.next_dispatcher);
        self.next_dispatcher += 1;
        let dispatcher = DispatcherHandle::spawn(id, self.clock.clone(), demand.requester.clone());
        let sink: Arc<dyn RequestNotificationSink> = Arc::new(dispatcher.clone());

        let mut avms = Vec::with_capacity(records.len());
        let mut outcome = Ok(());
        for record in records {
            let avm = AvmHandle::spawn(AvmId(self.next_avm), self.clock.clone(), Some(sink.clone()));
            self.next_avm += 1;
            avms.push(avm.clone());
            outcome = avm.allocate_cores(record.cores.clone()).await;
            if outcome.is_err() {
                break;
            }
        }
        if outcome.is_ok() {
            let vms = avms
                .iter()
                .map(|avm| Arc::new(avm.clone()) as Arc<dyn RequestSubmission>)
                .collect();
            outcome = dispatcher.register_vms(vms).await.map(|_| ());
        }

        match outcome {
            Ok(()) => Ok((dispatcher, avms)),
            Err(e) => {
                dispatcher.shutdown();
                for avm in &avms {
                    avm.shutdown();
                }
                Err(e)
            }
        }
    }

    /// Start a teardown; `reply` is answered by [`Self::release_drained`]
    fn terminate(&mut self, dispatcher: DispatcherId, reply: oneshot::Sender<Result<()>>) {
        let Some(deployment) = self
            .deployments
            .get_mut(&dispatcher)
            .filter(|d| !d.terminating)
        else {
            let _ = reply.send(Err(SchedError::UnknownApplication(dispatcher)));
            return;
        };
        deployment.terminating = true;
        info!(app = %deployment.app_uri, %dispatcher, "Draining application");

        let avms = deployment.avms.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            for avm in &avms {
                if let Err(e) = avm.drain().await {
                    warn!(avm = %avm.id(), error = %e, "Drain failed");
                }
            }
            // Dropped reply surfaces as Disconnected if the controller stopped
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(Command::Drained { dispatcher, reply });
            }
        });
    }

    async fn release_drained(&mut self, dispatcher: DispatcherId) -> Result<()> {
        let deployment = self
            .deployments
            .remove(&dispatcher)
            .ok_or(SchedError::UnknownApplication(dispatcher))?;
        self.terminated += 1;

        let cores: usize = deployment.records.iter().map(|r| r.cores.len()).sum();
        let released = self.release(deployment.records).await;
        // Components stop even if a release failed
        deployment.dispatcher.shutdown();
        for avm in &deployment.avms {
            avm.shutdown();
        }
        info!(app = %deployment.app_uri, %dispatcher, cores, "Application terminated");
        released
    }

    fn state(&self) -> AdmissionState {
        AdmissionState {
            computers: self.computers.len(),
            applications: self.deployments.values().filter(|d| !d.terminating).count(),
            reserved_cores: self
                .deployments
                .values()
                .flat_map(|d| &d.records)
                .map(|r| r.cores.len())
                .sum(),
            accepted: self.accepted,
            rejected: self.rejected,
            terminated: self.terminated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_hw::{
        AcceleratedClock, Clock, ComputerId, ComputerSpec, Frequency, FrequencyLevel, ProcessorId,
        ProcessorSpec, Request, SimDuration,
    };

    /// Computers of one processor each, with the given core counts
    fn pool(clock: &SharedClock, cores: &[usize]) -> Vec<ComputerHandle> {
        cores
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let processor = ProcessorSpec::new(
                    ProcessorId(i as u32),
                    n,
                    [FrequencyLevel::new(Frequency::new(1500), 1.5e6)],
                    Frequency::new(1500),
                    0,
                );
                ComputerHandle::spawn(
                    ComputerSpec::new(ComputerId(i as u32), vec![processor]),
                    clock.clone(),
                )
                .unwrap()
            })
            .collect()
    }

    async fn reserved(computers: &[ComputerHandle]) -> usize {
        let mut total = 0;
        for computer in computers {
            total += computer.dynamic_state().await.unwrap().reserved_count();
        }
        total
    }

    #[tokio::test(start_paused = true)]
    async fn test_shortfall_rolls_back_everything() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        // Room for two 2-core VMs, one computer with a single spare core
        let computers = pool(&clock, &[2, 3, 1]);
        let admission = AdmissionHandle::spawn(computers.clone(), clock, 0);

        let outcome = admission
            .submit_application(ApplicationDemand::new("app", 3, 2))
            .await
            .unwrap();
        match outcome {
            Admission::Rejected(RejectionReason::InsufficientCores {
                requested_avms,
                placed_avms,
            }) => {
                assert_eq!(requested_avms, 3);
                assert_eq!(placed_avms, 2);
            }
            other => panic!("expected a capacity rejection, got {other:?}"),
        }

        assert_eq!(reserved(&computers).await, 0);
        let state = admission.state().await.unwrap();
        assert_eq!((state.applications, state.rejected), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_avm_comes_from_one_computer() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let computers = pool(&clock, &[1, 2, 2]);
        let admission = AdmissionHandle::spawn(computers.clone(), clock, 0);

        let app = admission
            .submit_application(ApplicationDemand::new("app", 2, 2))
            .await
            .unwrap()
            .into_deployed()
            .unwrap();
        assert_eq!(app.avms.len(), 2);

        // The first computer's single core was offered back, not used
        let first = computers[0].dynamic_state().await.unwrap();
        assert_eq!(first.reserved_count(), 0);
        assert_eq!(reserved(&computers).await, 4);
        assert_eq!(admission.state().await.unwrap().reserved_cores, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_termination_releases_and_stops_components() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let computers = pool(&clock, &[4]);
        let admission = AdmissionHandle::spawn(computers.clone(), clock, 0);

        let app = admission
            .submit_application(ApplicationDemand::new("app", 2, 2))
            .await
            .unwrap()
            .into_deployed()
            .unwrap();
        assert_eq!(reserved(&computers).await, 4);

        admission
            .terminate_application(app.dispatcher_id)
            .await
            .unwrap();
        assert_eq!(reserved(&computers).await, 0);
        assert!(app.dispatcher.stats().await.is_err());

        let err = admission
            .terminate_application(app.dispatcher_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::UnknownApplication(_)));

        // Freed capacity is admissible again
        assert!(
            admission
                .submit_application(ApplicationDemand::new("again", 1, 4))
                .await
                .unwrap()
                .is_accepted()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_limit() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let computers = pool(&clock, &[8]);
        let admission = AdmissionHandle::spawn(computers.clone(), clock, 1);

        assert!(
            admission
                .submit_application(ApplicationDemand::new("one", 1, 1))
                .await
                .unwrap()
                .is_accepted()
        );
        let outcome = admission
            .submit_application(ApplicationDemand::new("two", 1, 1))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Admission::Rejected(RejectionReason::ApplicationLimit { limit: 1 })
        ));
        assert_eq!(reserved(&computers).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_demand() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let admission = AdmissionHandle::spawn(pool(&clock, &[2]), clock, 0);

        for demand in [
            ApplicationDemand::new("none", 0, 2),
            ApplicationDemand::new("empty", 2, 0),
        ] {
            let err = admission.submit_application(demand).await.unwrap_err();
            assert!(matches!(err, SchedError::InvalidDemand(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_admissions_never_share_cores() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let computers = pool(&clock, &[3, 3]);
        let admission = AdmissionHandle::spawn(computers.clone(), clock, 0);

        let mut joins = Vec::new();
        for i in 0..4 {
            let admission = admission.clone();
            joins.push(tokio::spawn(async move {
                admission
                    .submit_application(ApplicationDemand::new(format!("app-{i}"), 1, 2))
                    .await
                    .unwrap()
            }));
        }
        let mut accepted = 0;
        for join in joins {
            if join.await.unwrap().is_accepted() {
                accepted += 1;
            }
        }

        // Each computer fits exactly one 2-core VM
        assert_eq!(accepted, 2);
        assert_eq!(reserved(&computers).await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deployed_application_serves_requests() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let computers = pool(&clock, &[2]);
        let admission = AdmissionHandle::spawn(computers, clock, 0);
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();

        let app = admission
            .submit_application(ApplicationDemand::new("app", 1, 2).with_requester(Arc::new(tx)))
            .await
            .unwrap()
            .into_deployed()
            .unwrap();

        app.dispatcher
            .submit_request_and_notify(Request::new("job", 15_000_000))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().uri, "job");

        let stats = app.dispatcher.stats().await.unwrap();
        assert_eq!(stats.samples, 1);
        assert!((stats.average_execution_time - 10.0).abs() < 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_termination_waits_for_work_in_flight() {
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let computers = pool(&clock, &[1]);
        let admission = AdmissionHandle::spawn(computers.clone(), clock.clone(), 0);
        let (a_tx, mut a_rx) = mpsc::unbounded_channel::<Request>();

        let a = admission
            .submit_application(ApplicationDemand::new("a", 1, 1).with_requester(Arc::new(a_tx)))
            .await
            .unwrap()
            .into_deployed()
            .unwrap();
        // 100 simulated seconds
        a.dispatcher
            .submit_request_and_notify(Request::new("long", 150_000_000))
            .unwrap();
        clock.sleep(SimDuration::from_secs_f64(1.0)).await;

        let teardown = {
            let admission = admission.clone();
            let id = a.dispatcher_id;
            tokio::spawn(async move { admission.terminate_application(id).await })
        };
        clock.sleep(SimDuration::from_secs_f64(1.0)).await;

        // The busy core stays reserved while the application drains
        let early = admission
            .submit_application(ApplicationDemand::new("early", 1, 1))
            .await
            .unwrap();
        assert!(matches!(
            early,
            Admission::Rejected(RejectionReason::InsufficientCores { placed_avms: 0, .. })
        ));
        let state = admission.state().await.unwrap();
        assert_eq!((state.applications, state.reserved_cores), (0, 1));
        assert!(matches!(
            admission.terminate_application(a.dispatcher_id).await,
            Err(SchedError::UnknownApplication(_))
        ));

        teardown.await.unwrap().unwrap();
        assert!(clock.now().as_secs_f64() > 99.0);
        assert_eq!(a_rx.recv().await.unwrap().uri, "long");
        assert_eq!(reserved(&computers).await, 0);

        let (b_tx, mut b_rx) = mpsc::unbounded_channel::<Request>();
        let b = admission
            .submit_application(ApplicationDemand::new("b", 1, 1).with_requester(Arc::new(b_tx)))
            .await
            .unwrap()
            .into_deployed()
            .unwrap();
        b.dispatcher
            .submit_request_and_notify(Request::new("quick", 1_500_000))
            .unwrap();
        assert_eq!(b_rx.recv().await.unwrap().uri, "quick");
        assert_eq!(b.avms[0].state().await.unwrap().failed_starts, 0);
    }
}
