//! Whole-fabric assembly from configuration

use std::sync::Arc;
use tracing::{info, warn};

use fabric_config::{ComputerGroupConfig, ConfigError, FabricConfig, Validator};
use fabric_hw::{
    AcceleratedClock, ComputerHandle, ComputerId, ComputerSpec, Frequency, FrequencyLevel,
    HwError, ProcessorId, ProcessorSpec, SharedClock,
};

use crate::Result;
use crate::admission::{Admission, AdmissionHandle, AdmissionState, ApplicationDemand};
use crate::types::DispatcherId;

/// A running fabric: the computer pool behind one admission controller
#[derive(Debug, Clone)]
pub struct DataCenter {
    clock: SharedClock,
    computers: Arc<[ComputerHandle]>,
    admission: AdmissionHandle,
}

impl DataCenter {
    /// Validate `config` and start every computer and the admission controller
    pub fn from_config(config: &FabricConfig) -> Result<Self> {
        let warnings = Validator::new().validate(config).into_result()?;
        for warning in &warnings {
            warn!(%warning, "Configuration warning");
        }
        let clock = AcceleratedClock::shared(config.clock.acceleration)?;
        Self::with_clock(config, clock)
    }

    /// Start the fabric described by `config` on an existing clock
    ///
    /// Computer and processor ids are assigned consecutively across groups,
    /// in configuration order.
    pub fn with_clock(config: &FabricConfig, clock: SharedClock) -> Result<Self> {
        let cores = config.total_cores().ok_or_else(|| ConfigError::InvalidValue {
            field: "computers".to_string(),
            message: "total core count overflows".to_string(),
        })?;
        let mut computers: Vec<ComputerHandle> = Vec::new();
        let mut next_processor = Some(ProcessorId(0));

        for group in &config.computers {
            let template = processor_template(group);
            for _ in 0..group.count {
                let spawned =
                    spawn_computer(computers.len(), next_processor, group, &template, &clock);
                match spawned {
                    Ok((computer, next)) => {
                        next_processor = next;
                        computers.push(computer);
                    }
                    Err(e) => {
                        for computer in &computers {
                            computer.shutdown();
                        }
                        return Err(e.into());
                    }
                }
            }
        }

        let admission = AdmissionHandle::spawn(
            computers.clone(),
            clock.clone(),
            config.admission.max_applications,
        );
        info!(computers = computers.len(), cores, "Data center started");

        Ok(Self {
            clock,
            computers: computers.into(),
            admission,
        })
    }

    /// Simulated clock shared by every component
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Computers in admission scan order
    #[must_use]
    pub fn computers(&self) -> &[ComputerHandle] {
        &self.computers
    }

    /// Admission controller
    #[must_use]
    pub fn admission(&self) -> &AdmissionHandle {
        &self.admission
    }

    /// See [`AdmissionHandle::submit_application`]
    pub async fn submit_application(&self, demand: ApplicationDemand) -> Result<Admission> {
        self.admission.submit_application(demand).await
    }

    /// See [`AdmissionHandle::terminate_application`]
    pub async fn terminate_application(&self, dispatcher: DispatcherId) -> Result<()> {
        self.admission.terminate_application(dispatcher).await
    }

    /// Admission counters
    pub async fn state(&self) -> Result<AdmissionState> {
        self.admission.state().await
    }

    /// Stop admission and every computer, which stops their processors
    pub fn shutdown(&self) {
        self.admission.shutdown();
        for computer in self.computers.iter() {
            computer.shutdown();
        }
        info!("Data center stopped");
    }
}

/// Start the computer at pool `index` and return the id after its last processor
fn spawn_computer(
    index: usize,
    first_processor: Option<ProcessorId>,
    group: &ComputerGroupConfig,
    template: &ProcessorSpec,
    clock: &SharedClock,
) -> std::result::Result<(ComputerHandle, Option<ProcessorId>), HwError> {
    let id = u32::try_from(index)
        .map(ComputerId)
        .map_err(|_| HwError::InvalidConfig(format!("computer #{index} overflows the id space")))?;
    let first = first_processor
        .ok_or_else(|| HwError::InvalidConfig(format!("{id} has no processor ids left")))?;
    let spec = ComputerSpec::homogeneous(id, first, group.processors, template)?;
    let next = u32::try_from(group.processors)
        .ok()
        .and_then(|count| first.0.checked_add(count))
        .map(ProcessorId);
    Ok((ComputerHandle::spawn(spec, clock.clone())?, next))
}

fn processor_template(group: &ComputerGroupConfig) -> ProcessorSpec {
    ProcessorSpec::new(
        ProcessorId(0),
        group.cores_per_processor,
        group
            .levels
            .iter()
            .map(|level| {
                FrequencyLevel::new(Frequency::new(level.frequency), level.instructions_per_second)
            }),
        Frequency::new(group.default_frequency),
        group.max_frequency_gap,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchedError;
    use fabric_config::ConfigLoader;

    fn two_groups() -> FabricConfig {
        FabricConfig {
            computers: vec![
                ComputerGroupConfig {
                    count: 2,
                    processors: 2,
                    cores_per_processor: 1,
                    ..ComputerGroupConfig::default()
                },
                ComputerGroupConfig {
                    count: 1,
                    processors: 1,
                    cores_per_processor: 4,
                    ..ComputerGroupConfig::default()
                },
            ],
            ..FabricConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_consecutive_across_groups() {
        let dc = DataCenter::from_config(&two_groups()).unwrap();
        assert_eq!(dc.computers().len(), 3);

        let mut processor_ids = Vec::new();
        for (i, computer) in dc.computers().iter().enumerate() {
            assert_eq!(computer.id(), ComputerId(i as u32));
            let state = computer.static_state().await.unwrap();
            processor_ids.extend(state.processors);
        }
        assert_eq!(processor_ids, (0..5).map(ProcessorId).collect::<Vec<_>>());

        let last = dc.computers()[2].static_state().await.unwrap();
        assert_eq!(last.total_cores(), 4);
        dc.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_refused() {
        let config = ConfigLoader::load_from_str(
            r#"
            [clock]
            acceleration = 1000.0

            [[computers]]
            count = 1
            processors = 1
            cores_per_processor = 2
            default_frequency = 2000
            max_frequency_gap = 500
            levels = [ { frequency = 1500, instructions_per_second = 1.5e6 } ]
            "#,
        )
        .unwrap();
        // Default frequency missing from the ladder
        let err = DataCenter::from_config(&config).unwrap_err();
        assert!(matches!(err, SchedError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_processor_ids_beyond_u32_are_refused() {
        let config = FabricConfig {
            computers: vec![ComputerGroupConfig {
                count: 1,
                processors: usize::MAX,
                cores_per_processor: 1,
                ..ComputerGroupConfig::default()
            }],
            ..FabricConfig::default()
        };
        let clock = AcceleratedClock::shared(1000.0).unwrap();
        let err = DataCenter::with_clock(&config, clock).unwrap_err();
        assert!(matches!(err, SchedError::Hw(HwError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_over_configured_pool() {
        let dc = DataCenter::from_config(&two_groups()).unwrap();
        assert_eq!(dc.state().await.unwrap().computers, 3);

        // A 4-core VM only fits the last computer
        let app = dc
            .submit_application(ApplicationDemand::new("wide", 1, 4))
            .await
            .unwrap()
            .into_deployed()
            .unwrap();
        let last = dc.computers()[2].dynamic_state().await.unwrap();
        assert_eq!(last.reserved_count(), 4);

        dc.terminate_application(app.dispatcher_id).await.unwrap();
        let last = dc.computers()[2].dynamic_state().await.unwrap();
        assert_eq!(last.reserved_count(), 0);
        assert_eq!(dc.state().await.unwrap().terminated, 1);
    }
}
