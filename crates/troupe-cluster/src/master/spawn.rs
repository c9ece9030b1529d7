//! Spawning worker processes.
//!
//! Workers are the current binary re-executed with a hidden subcommand.
//! The master writes envelopes to the child's stdin and reads envelopes
//! from its stdout; the child's stderr is inherited for logs.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use troupe_core::ipc::read_envelopes;
use troupe_core::{ChannelSender, Endpoint};

use super::MasterEvent;
use crate::error::ClusterError;

/// Hidden subcommand running the agent bootstrap.
pub const AGENT_SUBCOMMAND: &str = "agent-worker";
/// Hidden subcommand running the app worker bootstrap.
pub const APP_SUBCOMMAND: &str = "app-worker";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Which kind of worker a child process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    App { worker_id: u32 },
}

impl Role {
    /// Endpoint stamped as `from` on every envelope the child emits.
    pub const fn endpoint(self) -> Endpoint {
        match self {
            Self::Agent => Endpoint::Agent,
            Self::App { .. } => Endpoint::App,
        }
    }

    pub fn label(self) -> String {
        match self {
            Self::Agent => "agent_worker".to_string(),
            Self::App { worker_id } => format!("app_worker#{worker_id}"),
        }
    }
}

/// A freshly spawned worker.
#[derive(Debug)]
pub struct Spawned {
    pub pid: u32,
    pub channel: ChannelSender,
}

/// Command line for a worker child, without the program.
pub fn worker_args(role: Role, config_arg: &str, debug_port: Option<u16>) -> Vec<String> {
    let mut args = Vec::with_capacity(4);
    match role {
        Role::Agent => {
            args.push(AGENT_SUBCOMMAND.to_string());
            args.push(config_arg.to_string());
            if let Some(port) = debug_port {
                args.push("--debug-port".to_string());
                args.push(port.to_string());
            }
        }
        Role::App { worker_id } => {
            args.push(APP_SUBCOMMAND.to_string());
            args.push(config_arg.to_string());
            args.push("--worker-id".to_string());
            args.push(worker_id.to_string());
        }
    }
    args
}

/// Spawn one worker and wire its channel into the master event loop.
///
/// Envelopes read from the child are forwarded as [`MasterEvent::Message`];
/// its exit is reported as [`MasterEvent::Exited`].
pub fn spawn_worker(
    program: &Path,
    role: Role,
    config_arg: &str,
    debug_port: Option<u16>,
    events: &mpsc::UnboundedSender<MasterEvent>,
) -> Result<Spawned, ClusterError> {
    let label = role.label();
    let spawn_error = |reason: String| ClusterError::Spawn {
        role: role.label(),
        reason,
    };

    let mut cmd = Command::new(program);
    cmd.args(worker_args(role, config_arg, debug_port))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
    let pid = child
        .id()
        .ok_or_else(|| spawn_error("child exited before reporting a pid".into()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_error("Failed to capture stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error("Failed to capture stdout".into()))?;

    let channel = ChannelSender::spawn_writer(stdin, label.clone());

    let reader_events = events.clone();
    let reader_label = label.clone();
    tokio::spawn(async move {
        read_envelopes(stdout, &reader_label, |mut envelope| {
            envelope.from = Some(role.endpoint());
            reader_events
                .send(MasterEvent::Message {
                    from: role.endpoint(),
                    envelope,
                })
                .is_ok()
        })
        .await;
    });

    let exit_events = events.clone();
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(worker = %label, pid, error = %e, "Error waiting for worker");
                None
            }
        };
        debug!(worker = %label, pid, ?code, "worker exited");
        let _ = exit_events.send(MasterEvent::Exited { role, pid, code });
    });

    info!(worker = %role.label(), pid, "worker spawned");
    Ok(Spawned { pid, channel })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_args_carry_debug_port_only_when_set() {
        assert_eq!(
            worker_args(Role::Agent, "{}", None),
            vec!["agent-worker", "{}"]
        );
        assert_eq!(
            worker_args(Role::Agent, "{}", Some(5800)),
            vec!["agent-worker", "{}", "--debug-port", "5800"]
        );
    }

    #[test]
    fn app_args_carry_worker_id() {
        assert_eq!(
            worker_args(Role::App { worker_id: 3 }, "{\"workers\":2}", None),
            vec!["app-worker", "{\"workers\":2}", "--worker-id", "3"]
        );
    }

    #[test]
    fn roles_map_to_endpoints() {
        assert_eq!(Role::Agent.endpoint(), Endpoint::Agent);
        assert_eq!(Role::App { worker_id: 1 }.endpoint(), Endpoint::App);
        assert_eq!(Role::App { worker_id: 7 }.label(), "app_worker#7");
    }
}
