//! troupe cluster
//!
//! Master/agent/app-worker orchestration:
//! - [`master`]: startup sequence, worker spawning, failure propagation
//! - [`messenger`]: envelope routing between cluster members
//! - [`manager`]: process registry and health check
//! - [`bootstrap`]: agent and app worker entry points

pub mod bootstrap;
pub mod error;
pub mod manager;
pub mod master;
pub mod messenger;
pub mod shutdown;

pub use error::{ClusterError, WorkerCount};
pub use manager::Manager;
pub use master::{Master, MasterOptions};
pub use messenger::Messenger;
