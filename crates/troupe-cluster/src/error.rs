//! Errors that terminate the cluster.

use troupe_core::ReadyError;

/// Registry counts attached to a health escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerCount {
    pub agent: usize,
    pub worker: usize,
}

/// Fatal cluster errors. Every variant maps to exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Configuration error: {0}")]
    Config(#[from] troupe_core::Error),

    #[error("Failed to detect a free port: {0}")]
    PortDetection(#[source] std::io::Error),

    #[error("Failed to spawn {role}: {reason}")]
    Spawn { role: String, reason: String },

    #[error("Failed to write pid file {path}: {source}")]
    PidFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to construct agent: {0}")]
    AgentConstruction(String),

    #[error("Agent start error: {0}")]
    AgentStartup(ReadyError),

    #[error("Agent worker exited before start (code: {code:?})")]
    AgentExited { code: Option<i32> },

    #[error("Cluster failed to become ready: {0}")]
    NotReady(#[from] ReadyError),

    #[error(
        "{} agent and {} worker(s) alive, exit to avoid unknown state",
        .0.agent,
        .0.worker
    )]
    ClusterHealth(WorkerCount),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
