//! Simulated data-center compute fabric
//!
//! Facade over the workspace crates:
//!
//! - [`hw`]: simulated time, cores, processors and computers
//! - [`sched`]: application VMs, request dispatchers and admission control
//! - [`config`]: TOML/environment configuration and validation
//! - [`telemetry`]: structured logging setup
//!
//! # Example
//!
//! ```no_run
//! use fabric::config::ConfigLoader;
//! use fabric::sched::{ApplicationDemand, DataCenter};
//! use fabric::telemetry::init_logging;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::new().load()?;
//!     init_logging(&(&config.log).try_into()?)?;
//!
//!     let dc = DataCenter::from_config(&config)?;
//!     let outcome = dc
//!         .submit_application(ApplicationDemand::new("web", 2, 1))
//!         .await?;
//!     if let Some(app) = outcome.into_deployed() {
//!         dc.terminate_application(app.dispatcher_id).await?;
//!     }
//!     dc.shutdown();
//!     Ok(())
//! }
//! ```

pub use fabric_config as config;
pub use fabric_hw as hw;
pub use fabric_sched as sched;
pub use fabric_telemetry as telemetry;
