//! healthmesh - distributed endpoint health checking and alarm distribution
//!
//! A master watches a hierarchical coordination store where services
//! register `ip:port` leaves, turns registrations into health-check jobs and
//! streams them to slaves. Slaves probe the endpoints and report back; the
//! master mirrors reports from a durable store and raises alarms for failing
//! jobs. Registration churn is debounced into Lost/BackOnline/New alarms.
//!
//! # Architecture
//!
//! - [`coordination`] - Store contract, in-memory store and recursive tree watcher
//! - [`classifier`] - Flap suppression over registration events
//! - [`pool`] - Job derivation and zone-filtered fan-out to slaves
//! - [`collector`] - Slave-side probe tasks and the master client
//! - [`store`] - Durable job reports and the reconciled report cache
//! - [`policy`] - Failure evaluation and alarm emission
//! - [`alarm`] - Alarm sinks and maintenance windows
//! - [`platform`] - Component health aggregated from replica reports
//! - [`server`] - Master HTTP API
//! - [`config`] - Configuration management and settings
//!
//! # Example
//!
//! ```no_run
//! use healthmesh::config::Config;
//! use healthmesh::server::MasterServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let server = MasterServer::from_config(config.master).await?;
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```

pub mod alarm;
pub mod classifier;
pub mod collector;
pub mod config;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod models;
pub mod platform;
pub mod policy;
pub mod pool;
pub mod server;
pub mod store;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::alarm::{AlarmOptions, AlarmSink};
    pub use crate::collector::{JobCollector, JobSource, MasterClient};
    pub use crate::config::Config;
    pub use crate::coordination::{CoordinationStore, LeafHandler, TreeWatcher};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{Job, JobAction, JobKey, Protocol, RegistrationEntry, SlaveInfo, Zone};
    pub use crate::server::MasterServer;
    pub use crate::store::{DurableStore, JobStore};
}

// Direct re-exports for convenience
pub use models::{Job, JobAction, JobKey, Protocol, RegistrationEntry, SlaveInfo, Zone};
