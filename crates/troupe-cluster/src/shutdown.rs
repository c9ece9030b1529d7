//! Termination signals and child shutdown.
//!
//! ## Signals
//! **Unix:** `SIGINT`, `SIGTERM`, `SIGQUIT` (plus `ctrl_c` as a fallback).
//! **Windows:** `Ctrl-C` via [`tokio::signal::ctrl_c`].

use std::time::Duration;

#[cfg(not(unix))]
use tracing::debug;
#[cfg(unix)]
use tracing::{info, warn};

/// Default time children get to exit after `SIGTERM`.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Waits for a termination signal.
///
/// Returns `Err` if signal registration fails.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Ask a child process to terminate.
#[cfg(unix)]
pub fn terminate(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range");
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => info!(pid, "sent SIGTERM"),
        Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM"),
    }
}

/// Ask a child process to terminate.
///
/// Without POSIX signals this only logs; the child is killed when the
/// master drops its process handle.
#[cfg(not(unix))]
pub fn terminate(pid: u32) {
    debug!(pid, "no signal support, worker is killed on drop");
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminate_stops_a_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        terminate(child.id().unwrap());
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
