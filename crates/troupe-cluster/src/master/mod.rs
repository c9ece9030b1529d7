//! Cluster master.
//!
//! Owns the process registry, the message router and the readiness
//! lifecycle, and drives the startup sequence:
//!
//! ```text
//! detect ports ─► spawn agent ─► agent-start ─► fork app workers
//!                                                   │
//!          egg-ready ◄── ready ◄── boot ready ◄── app-start × workers
//! ```
//!
//! Any failure that leaves the topology unrecoverable ends [`Master::run`]
//! with an error; nothing is retried or respawned in-process.

pub mod pidfile;
pub mod ports;
pub mod spawn;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use troupe_core::config::agent_debug_port_from_env;
use troupe_core::ipc::read_envelopes;
use troupe_core::{
    Action, ChannelSender, ClusterConfig, Deployment, Endpoint, Envelope, Framework, Lifecycle,
    ReadyError, ReadyTask,
};

use crate::error::{ClusterError, WorkerCount};
use crate::manager::{
    DEFAULT_CHECK_INTERVAL, Manager, ProcessHandle, ProcessStatus, WorkerHandle, WorkerState,
};
use crate::messenger::Messenger;
use crate::shutdown::{self, DEFAULT_GRACE};
use spawn::{Role, spawn_worker};

/// Runtime knobs of the master that are not part of the cluster configuration.
#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// Binary re-executed for worker processes.
    pub program: PathBuf,
    /// Exchange envelopes with a parent process over stdin/stdout.
    pub parent_ipc: bool,
    pub deployment: Deployment,
    pub check_interval: Duration,
    pub shutdown_grace: Duration,
    pub agent_debug_port: u16,
}

impl MasterOptions {
    /// Options for the running binary, with environment overrides applied.
    pub fn from_env() -> Result<Self, ClusterError> {
        Ok(Self {
            program: std::env::current_exe()?,
            parent_ipc: false,
            deployment: Deployment::from_env(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            shutdown_grace: DEFAULT_GRACE,
            agent_debug_port: agent_debug_port_from_env(),
        })
    }
}

/// Everything that feeds the master event loop.
#[derive(Debug)]
pub enum MasterEvent {
    /// An envelope read from a child or from the parent.
    Message { from: Endpoint, envelope: Envelope },
    /// A child process exited.
    Exited {
        role: Role,
        pid: u32,
        code: Option<i32>,
    },
    /// The parent closed its channel.
    ParentDisconnected,
    /// The readiness lifecycle resolved.
    Ready(Result<(), ReadyError>),
    /// The health check escalated.
    Unhealthy(WorkerCount),
}

pub struct Master {
    config: ClusterConfig,
    framework: Arc<dyn Framework>,
    options: MasterOptions,
    manager: Arc<Manager>,
    messenger: Arc<Messenger>,
    lifecycle: Lifecycle,
    events_tx: mpsc::UnboundedSender<MasterEvent>,
    events_rx: mpsc::UnboundedReceiver<MasterEvent>,
    created_at: Instant,
    agent_spawned_at: Option<Instant>,
    agent_ready: Option<ReadyTask>,
    app_ready: HashMap<u32, ReadyTask>,
    is_started: bool,
    health_check: Option<AbortHandle>,
}

impl Master {
    /// Validate the configuration, log the startup banner and write the pid file.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: ClusterConfig,
        framework: Arc<dyn Framework>,
        options: MasterOptions,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        let lifecycle = Lifecycle::from_env()?;

        info!(
            "[master] =================== {} start =====================",
            framework.name()
        );
        info!(
            framework = framework.name(),
            version = framework.version(),
            "[master] framework version"
        );
        if options.deployment.is_production() {
            let pretty = serde_json::to_string_pretty(&config).unwrap_or_default();
            info!("[master] start with options:\n{pretty}");
        } else {
            let compact = serde_json::to_string(&config).unwrap_or_default();
            info!("[master] start with options: {compact}");
        }
        info!(
            production = options.deployment.is_production(),
            parent_ipc = options.parent_ipc,
            "[master] start with env"
        );

        if let Some(path) = &config.pid_file {
            pidfile::write_pid_file(path, std::process::id())?;
        }

        let parent = options
            .parent_ipc
            .then(|| ChannelSender::spawn_writer(tokio::io::stdout(), "parent"));
        let manager = Arc::new(Manager::new());
        let messenger = Arc::new(Messenger::new(
            std::process::id(),
            Arc::clone(&manager),
            parent,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            framework,
            options,
            manager,
            messenger,
            lifecycle,
            events_tx,
            events_rx,
            created_at: Instant::now(),
            agent_spawned_at: None,
            agent_ready: None,
            app_ready: HashMap::new(),
            is_started: false,
            health_check: None,
        })
    }

    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn manager(&self) -> Arc<Manager> {
        Arc::clone(&self.manager)
    }

    pub fn messenger(&self) -> Arc<Messenger> {
        Arc::clone(&self.messenger)
    }

    /// The master's own readiness lifecycle; boot hooks may be added before `run`.
    pub const fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub const fn is_started(&self) -> bool {
        self.is_started
    }

    /// Run the cluster until `shutdown` resolves or a fatal error occurs.
    ///
    /// Children are asked to terminate before returning in both cases.
    pub async fn run<S>(mut self, shutdown: S) -> Result<(), ClusterError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if self.options.parent_ipc {
            self.spawn_parent_reader();
        }

        let (cluster_port, sticky_worker_port) =
            match ports::detect_ports(self.config.sticky).await {
                Ok(ports) => ports,
                Err(e) => {
                    error!(error = %e, "[master] port detection failed");
                    return Err(e);
                }
            };
        self.config = self
            .config
            .clone()
            .with_detected_ports(cluster_port, sticky_worker_port);
        let config_arg = self.config.to_arg()?;

        let mut agent_start = self.messenger.bus().subscribe(Action::AgentStart);
        let mut app_start = self.messenger.bus().subscribe(Action::AppStart);

        self.agent_ready = Some(self.lifecycle.register("agent_worker"));
        self.lifecycle.start();
        self.spawn_ready_watch();

        let result = match self.fork_agent(&config_arg).await {
            Err(e) => Err(e),
            Ok(()) => loop {
                tokio::select! {
                    () = &mut shutdown => {
                        info!("[master] received shutdown signal");
                        break Ok(());
                    }
                    Some(event) = self.events_rx.recv() => {
                        if let Err(e) = self.handle_event(event).await {
                            break Err(e);
                        }
                    }
                    Ok(_) = agent_start.recv() => {
                        if let Err(e) = self.on_agent_start(&config_arg).await {
                            break Err(e);
                        }
                    }
                    Ok(envelope) = app_start.recv() => self.on_app_start(&envelope).await,
                }
            },
        };

        if let Some(check) = self.health_check.take() {
            check.abort();
        }
        self.stop_children().await;
        result
    }

    fn spawn_parent_reader(&self) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            read_envelopes(tokio::io::stdin(), "parent", |mut envelope| {
                envelope.from = Some(Endpoint::Parent);
                events
                    .send(MasterEvent::Message {
                        from: Endpoint::Parent,
                        envelope,
                    })
                    .is_ok()
            })
            .await;
            let _ = events.send(MasterEvent::ParentDisconnected);
        });
    }

    fn spawn_ready_watch(&self) {
        let lifecycle = self.lifecycle.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = lifecycle.ready().await;
            let _ = events.send(MasterEvent::Ready(outcome));
        });
    }

    async fn fork_agent(&mut self, config_arg: &str) -> Result<(), ClusterError> {
        self.agent_spawned_at = Some(Instant::now());
        let debug_port = self
            .config
            .is_debug
            .then_some(self.options.agent_debug_port);
        let spawned = spawn_worker(
            &self.options.program,
            Role::Agent,
            config_arg,
            debug_port,
            &self.events_tx,
        )?;
        self.manager
            .set_agent(ProcessHandle::new(1, spawned.pid, spawned.channel))
            .await;
        info!(
            pid = spawned.pid,
            cluster_port = ?self.config.cluster_port,
            "[master] agent_worker#1:{} start",
            spawned.pid
        );
        Ok(())
    }

    async fn fork_app_workers(&mut self, config_arg: &str) -> Result<(), ClusterError> {
        let workers = u32::try_from(self.config.workers).unwrap_or(u32::MAX);
        for worker_id in 1..=workers {
            let role = Role::App { worker_id };
            let task = self.lifecycle.register(role.label());
            let spawned =
                spawn_worker(&self.options.program, role, config_arg, None, &self.events_tx)?;
            self.manager
                .set_worker(WorkerHandle::new(ProcessHandle::new(
                    worker_id,
                    spawned.pid,
                    spawned.channel,
                )))
                .await;
            self.app_ready.insert(worker_id, task);
        }
        info!(workers, "[master] forked app workers");
        Ok(())
    }

    async fn handle_event(&mut self, event: MasterEvent) -> Result<(), ClusterError> {
        match event {
            MasterEvent::Message { from, mut envelope } => {
                envelope.from = Some(from);
                self.messenger.send(envelope).await;
            }
            MasterEvent::Exited { role, pid, code } => self.on_exit(role, pid, code).await?,
            MasterEvent::ParentDisconnected => self.messenger.parent_disconnected(),
            MasterEvent::Ready(outcome) => self.on_ready(outcome).await?,
            MasterEvent::Unhealthy(count) => {
                error!(
                    agent = count.agent,
                    worker = count.worker,
                    "[master] {} agent and {} worker(s) alive, exit to avoid unknown state",
                    count.agent,
                    count.worker
                );
                return Err(ClusterError::ClusterHealth(count));
            }
        }
        Ok(())
    }

    async fn on_agent_start(&mut self, config_arg: &str) -> Result<(), ClusterError> {
        let Some(agent_ready) = self.agent_ready.take() else {
            debug!("[master] ignoring duplicate agent-start");
            return Ok(());
        };
        self.manager.set_agent_status(ProcessStatus::Started).await;
        let elapsed_ms = self
            .agent_spawned_at
            .map_or(0, |t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX));
        info!(elapsed_ms, "[master] agent_worker#1 started ({elapsed_ms}ms)");

        // worker tasks must be registered before the agent task completes
        self.fork_app_workers(config_arg).await?;
        agent_ready.done();
        Ok(())
    }

    async fn on_app_start(&mut self, envelope: &Envelope) {
        let worker_id = envelope
            .data
            .get("workerId")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok());
        let Some(worker_id) = worker_id else {
            warn!(data = %envelope.data, "[master] app-start without worker id");
            return;
        };
        self.manager
            .set_worker_state(worker_id, WorkerState::Listening)
            .await;
        self.manager
            .set_worker_status(worker_id, ProcessStatus::Started)
            .await;
        if let Some(task) = self.app_ready.remove(&worker_id) {
            info!(worker_id, "[master] app_worker#{worker_id} started");
            task.done();
        }
    }

    async fn on_exit(
        &mut self,
        role: Role,
        pid: u32,
        code: Option<i32>,
    ) -> Result<(), ClusterError> {
        match role {
            Role::Agent => {
                let agent = self.manager.agent().await.filter(|a| a.pid == pid);
                let Some(agent) = agent else {
                    return Ok(());
                };
                self.manager.delete_agent().await;
                if agent.status == ProcessStatus::Starting {
                    error!(
                        pid,
                        ?code,
                        "[master] agent_worker#1:{pid} start fail, exiting with code:1"
                    );
                    return Err(ClusterError::AgentExited { code });
                }
                error!(pid, ?code, "[master] agent_worker#1:{pid} died");
            }
            Role::App { worker_id } => {
                self.manager.delete_worker(worker_id).await;
                if let Some(task) = self.app_ready.remove(&worker_id) {
                    task.fail(ReadyError::new(format!(
                        "app_worker#{worker_id}:{pid} exited before start (code: {code:?})"
                    )));
                }
                error!(worker_id, pid, ?code, "[master] app_worker#{worker_id}:{pid} died");
            }
        }
        Ok(())
    }

    async fn on_ready(&mut self, outcome: Result<(), ReadyError>) -> Result<(), ClusterError> {
        if let Err(e) = outcome {
            error!(error = %e, "[master] cluster start failed");
            return Err(ClusterError::NotReady(e));
        }
        self.is_started = true;

        let protocol = self.config.protocol();
        let port = self.config.port.or(self.config.cluster_port);
        let address = format!("{protocol}://127.0.0.1:{}", port.unwrap_or_default());
        let elapsed_ms = u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        let sticky = if self.config.sticky { "  with STICKY MODE!" } else { "" };
        info!(
            elapsed_ms,
            "[master] {} started on {address} ({elapsed_ms}ms){sticky}",
            self.framework.name()
        );

        let options = serde_json::to_value(&self.config).unwrap_or(Value::Null);
        let to_parent = json!({
            "port": self.config.port,
            "address": address,
            "protocol": protocol,
        });
        for (to, data) in [
            (Endpoint::Parent, to_parent),
            (Endpoint::App, options.clone()),
            (Endpoint::Agent, options),
        ] {
            self.messenger
                .send(
                    Envelope::new(Action::EggReady)
                        .addressed_to(to)
                        .with_data(data),
                )
                .await;
        }

        if self.options.deployment.is_production() {
            self.start_health_check();
        }

        #[cfg(unix)]
        {
            if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
                debug!(error = %e, "sd_notify unavailable");
            }
        }
        Ok(())
    }

    fn start_health_check(&mut self) {
        let check = self.manager.start_check(self.options.check_interval);
        self.health_check = Some(check.abort_handle());
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if let Ok(count) = check.await {
                let _ = events.send(MasterEvent::Unhealthy(count));
            }
        });
        info!(
            interval_secs = self.options.check_interval.as_secs(),
            "[master] health check started"
        );
    }

    async fn stop_children(&mut self) {
        self.manager.set_all_status(ProcessStatus::Stopping).await;
        let mut remaining: HashSet<u32> = self.manager.child_pids().await.into_iter().collect();
        if remaining.is_empty() {
            return;
        }
        for pid in &remaining {
            shutdown::terminate(*pid);
        }

        let deadline = tokio::time::sleep(self.options.shutdown_grace);
        tokio::pin!(deadline);
        while !remaining.is_empty() {
            tokio::select! {
                () = &mut deadline => {
                    warn!(remaining = remaining.len(), "[master] children did not exit in time");
                    break;
                }
                event = self.events_rx.recv() => match event {
                    Some(MasterEvent::Exited { role, pid, code }) => {
                        remaining.remove(&pid);
                        debug!(worker = %role.label(), pid, ?code, "[master] child stopped");
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        self.manager.set_all_status(ProcessStatus::Stopped).await;
        info!("[master] all children stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;
    use troupe_core::{BasicFramework, ClusterOptions};

    struct Fixture {
        master: Master,
        parent: UnboundedReceiver<Envelope>,
        agent: UnboundedReceiver<Envelope>,
        app: UnboundedReceiver<Envelope>,
        _dir: tempfile::TempDir,
    }

    /// A master with in-process parent, agent and app worker channels.
    async fn fixture(deployment: Deployment) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = ClusterOptions {
            base_dir: Some(dir.path().to_path_buf()),
            workers: Some(1),
            port: Some(7001),
            ..ClusterOptions::default()
        }
        .resolve()
        .unwrap()
        .with_detected_ports(40123, None);
        let options = MasterOptions {
            program: PathBuf::from("false"),
            parent_ipc: false,
            deployment,
            check_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
            agent_debug_port: 5800,
        };
        let mut master = Master::new(config, Arc::new(BasicFramework::new()), options).unwrap();

        let (parent_tx, parent) = ChannelSender::detached("parent");
        master.messenger = Arc::new(Messenger::new(
            std::process::id(),
            Arc::clone(&master.manager),
            Some(parent_tx),
        ));
        let (agent_tx, agent) = ChannelSender::detached("agent");
        let (app_tx, app) = ChannelSender::detached("app");
        master
            .manager
            .set_agent(ProcessHandle::new(1, 501, agent_tx))
            .await;
        master
            .manager
            .set_worker(WorkerHandle::new(ProcessHandle::new(1, 502, app_tx)))
            .await;

        Fixture {
            master,
            parent,
            agent,
            app,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn ready_broadcasts_egg_ready_per_destination() {
        let mut f = fixture(Deployment::Local).await;
        f.master.on_ready(Ok(())).await.unwrap();
        assert!(f.master.is_started());

        let parent = f.parent.try_recv().unwrap();
        assert_eq!(parent.action, Action::EggReady);
        assert_eq!(parent.to, Some(Endpoint::Parent));
        assert_eq!(
            parent.data,
            json!({
                "port": 7001,
                "address": "http://127.0.0.1:7001",
                "protocol": "http",
            })
        );

        let options = serde_json::to_value(f.master.config()).unwrap();
        for (rx, to) in [(&mut f.app, Endpoint::App), (&mut f.agent, Endpoint::Agent)] {
            let envelope = rx.try_recv().unwrap();
            assert_eq!(envelope.action, Action::EggReady);
            assert_eq!(envelope.to, Some(to));
            assert_eq!(envelope.data, options);
            assert!(rx.try_recv().is_err());
        }
        assert!(f.parent.try_recv().is_err());
    }

    #[tokio::test]
    async fn health_check_stays_off_outside_production() {
        let mut f = fixture(Deployment::Local).await;
        f.master.on_ready(Ok(())).await.unwrap();
        assert!(f.master.health_check.is_none());
    }

    #[tokio::test]
    async fn ready_error_fails_the_cluster() {
        let mut f = fixture(Deployment::Production).await;
        let err = f
            .master
            .on_ready(Err(ReadyError::new("app_worker#1 exited before start")))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotReady(_)));
        assert!(!f.master.is_started());
        assert!(f.master.health_check.is_none());
        assert!(f.parent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn production_escalation_ends_the_master() {
        let mut f = fixture(Deployment::Production).await;
        f.master.manager.set_agent_status(ProcessStatus::Started).await;
        f.master.on_ready(Ok(())).await.unwrap();
        assert!(f.master.health_check.is_some());

        f.master.manager.delete_worker(1).await;
        let event = f.master.events_rx.recv().await.unwrap();
        assert!(matches!(event, MasterEvent::Unhealthy(_)));

        let err = f.master.handle_event(event).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::ClusterHealth(WorkerCount { agent: 1, worker: 0 })
        ));
    }
}
