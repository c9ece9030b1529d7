//! Worker-side bootstraps for the agent and the app workers.
//!
//! Both follow the same sequence: parse the configuration argument,
//! preload the required modules, construct the instance, treat any error
//! before ready as fatal, report the start action to the master, then
//! serve until a termination signal or until the master closes stdin.

use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info};

use troupe_core::ipc::read_envelopes;
use troupe_core::{
    Action, ChannelSender, ClusterConfig, Endpoint, Envelope, Framework, Instance, LifecycleEvent,
    ReadyError,
};

use crate::error::ClusterError;
use crate::shutdown::wait_for_shutdown_signal;

/// Run the agent worker over the process's stdin/stdout.
///
/// `debug_port` only tags the agent's logs; no debugger listens on it.
pub async fn run_agent_worker(
    framework: Arc<dyn Framework>,
    config_arg: &str,
    debug_port: Option<u16>,
) -> Result<(), ClusterError> {
    let config = ClusterConfig::from_arg(config_arg)?;
    debug!(?config, "new Agent with options");
    if let Some(port) = debug_port {
        info!(port, "agent_worker debug port");
    }

    preload(framework.as_ref(), &config).map_err(|e| agent_construction(&e))?;
    let agent = framework
        .create_agent(&config)
        .map_err(|e| agent_construction(&e))?;

    let started = Envelope::new(Action::AgentStart).addressed_to(Endpoint::Master);
    serve(
        agent,
        "agent_worker",
        started,
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown_signal(),
    )
    .await
    .map_err(ClusterError::AgentStartup)
}

/// Run one app worker over the process's stdin/stdout.
pub async fn run_app_worker(
    framework: Arc<dyn Framework>,
    config_arg: &str,
    worker_id: u32,
) -> Result<(), ClusterError> {
    let config = ClusterConfig::from_arg(config_arg)?;
    preload(framework.as_ref(), &config)?;
    let app = framework.create_application(&config, worker_id)?;

    let started = Envelope::new(Action::AppStart)
        .addressed_to(Endpoint::Master)
        .with_data(json!({ "workerId": worker_id, "pid": std::process::id() }));
    let label = format!("app_worker#{worker_id}");
    serve(
        app,
        &label,
        started,
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown_signal(),
    )
    .await
    .map_err(ClusterError::NotReady)
}

fn preload(framework: &dyn Framework, config: &ClusterConfig) -> troupe_core::Result<()> {
    for module in &config.require {
        framework.preload(module)?;
    }
    Ok(())
}

fn agent_construction(e: &troupe_core::Error) -> ClusterError {
    error!(error = %e, "[agent_worker] failed to construct agent");
    ClusterError::AgentConstruction(e.to_string())
}

async fn shutdown_signal() {
    if let Err(e) = wait_for_shutdown_signal().await {
        error!(error = %e, "Failed to install signal handlers");
        std::future::pending::<()>().await;
    }
}

/// Wait for the first error event; never resolves if the channel closes.
async fn next_error(events: &mut broadcast::Receiver<LifecycleEvent>) -> ReadyError {
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::Error(e)) => return e,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Drive one worker instance over an IPC channel.
///
/// Returns an error only for failures before ready. After ready the
/// instance is closed when `shutdown` resolves or `input` reaches EOF.
pub async fn serve<R, W, S>(
    instance: Arc<dyn Instance>,
    label: &str,
    started: Envelope,
    input: R,
    output: W,
    shutdown: S,
) -> Result<(), ReadyError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let master = ChannelSender::spawn_writer(output, "master");
    let mut errors = instance.events();

    let reader_label = label.to_string();
    let mut disconnected = tokio::spawn(async move {
        read_envelopes(input, "master", |envelope| {
            if envelope.action == Action::EggReady {
                info!(worker = %reader_label, "cluster ready");
            } else {
                debug!(worker = %reader_label, action = %envelope.action, "received envelope");
            }
            true
        })
        .await;
    });

    let startup = tokio::select! {
        result = instance.ready() => result,
        e = next_error(&mut errors) => Err(e),
    };
    if let Err(e) = startup {
        error!(worker = label, error = %e, "start error, exiting with code:1");
        disconnected.abort();
        return Err(e);
    }
    drop(errors);

    master.send(&started);
    info!(worker = label, action = %started.action, "worker started");

    tokio::select! {
        () = shutdown => info!(worker = label, "received shutdown signal"),
        _ = &mut disconnected => info!(worker = label, "master channel closed"),
    }

    if let Err(e) = instance.close().await {
        error!(worker = label, error = %e, "Failed to close instance");
    }
    disconnected.abort();
    info!(worker = label, "worker stopped");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use troupe_core::{BasicFramework, Barrier, Boot};

    fn config() -> ClusterConfig {
        ClusterConfig {
            base_dir: std::env::temp_dir(),
            framework: "troupe".into(),
            workers: 1,
            port: None,
            sticky: false,
            sticky_worker_port: None,
            cluster_port: None,
            https: None,
            is_debug: false,
            require: Vec::new(),
            pid_file: None,
        }
    }

    struct Refuse;

    #[async_trait]
    impl Boot for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        async fn will_ready(&self, _boot_ready: &Barrier) -> Result<(), ReadyError> {
            Err(ReadyError::new("database unreachable"))
        }
    }

    #[tokio::test]
    async fn reports_start_and_stops_on_disconnect() {
        let agent = BasicFramework::new().create_agent(&config()).unwrap();
        let (mut master_in, worker_in) = tokio::io::duplex(4096);
        let (worker_out, master_out) = tokio::io::duplex(4096);

        let started = Envelope::new(Action::AgentStart).addressed_to(Endpoint::Master);
        let worker = tokio::spawn(serve(
            agent,
            "agent_worker",
            started,
            worker_in,
            worker_out,
            std::future::pending(),
        ));

        let mut lines = BufReader::new(master_out).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let envelope: Envelope = serde_json::from_str(&line).unwrap();
        assert_eq!(envelope.action, Action::AgentStart);
        assert_eq!(envelope.to, Some(Endpoint::Master));

        master_in
            .write_all(b"{\"action\":\"egg-ready\",\"to\":\"agent\"}\n")
            .await
            .unwrap();
        drop(master_in);
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn startup_error_is_fatal() {
        let agent = BasicFramework::new()
            .with_agent_boot(Arc::new(Refuse))
            .create_agent(&config())
            .unwrap();
        let (_master_in, worker_in) = tokio::io::duplex(4096);
        let (worker_out, master_out) = tokio::io::duplex(4096);

        let err = serve(
            agent,
            "agent_worker",
            Envelope::new(Action::AgentStart),
            worker_in,
            worker_out,
            std::future::pending(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message(), "database unreachable");

        // nothing was reported to the master
        let mut lines = BufReader::new(master_out).lines();
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_the_instance() {
        let app = BasicFramework::new()
            .create_application(&config(), 1)
            .unwrap();
        let (_master_in, worker_in) = tokio::io::duplex(4096);
        let (worker_out, _master_out) = tokio::io::duplex(4096);

        serve(
            app,
            "app_worker#1",
            Envelope::new(Action::AppStart),
            worker_in,
            worker_out,
            async {},
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn bad_config_argument_is_rejected() {
        let err = run_app_worker(Arc::new(BasicFramework::new()), "not json", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Config(_)));
    }

    #[tokio::test]
    async fn unknown_required_module_fails_agent_construction() {
        let mut config = config();
        config.require = vec!["missing".into()];
        let err = run_agent_worker(
            Arc::new(BasicFramework::new()),
            &config.to_arg().unwrap(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClusterError::AgentConstruction(_)));
    }
}
