//! Troupe Core Library
//!
//! Shared functionality for troupe components:
//! - Cluster configuration resolution and validation
//! - NDJSON envelope channels between master and workers
//! - Readiness barriers and the instance lifecycle
//! - Framework provider traits
//! - Common error types

pub mod config;
pub mod error;
pub mod framework;
pub mod ipc;
pub mod readiness;
pub mod tracing_init;

pub use config::{ClusterConfig, ClusterOptions, Deployment};
pub use error::{Error, Result};
pub use framework::{BasicFramework, Framework, Instance, InstanceKind};
pub use ipc::{Action, ChannelSender, Endpoint, Envelope};
pub use readiness::{Barrier, Boot, Lifecycle, LifecycleEvent, ReadyError, ReadyTask};
