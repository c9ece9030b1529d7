//! troupe
//!
//! Starts a cluster master, or (through hidden subcommands) one of the
//! worker processes the master spawns by re-executing this binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use troupe_cluster::bootstrap::{run_agent_worker, run_app_worker};
use troupe_cluster::shutdown::wait_for_shutdown_signal;
use troupe_cluster::{Master, MasterOptions};
use troupe_core::config::TlsConfig;
use troupe_core::tracing_init::{
    AGENT_LEVEL_ENV, APP_LEVEL_ENV, MASTER_LEVEL_ENV, init_tracing, role_filter,
};
use troupe_core::{BasicFramework, ClusterOptions, Framework};

const LOG_TARGETS: &[&str] = &["troupe", "troupe_cluster", "troupe_core"];

#[derive(Parser, Debug)]
#[command(name = "troupe")]
#[command(version, about = "troupe - master/agent/app worker cluster")]
struct Args {
    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "TROUPE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the cluster master.
    Start(StartArgs),

    /// Agent worker entry point (spawned by the master).
    #[command(hide = true)]
    AgentWorker {
        /// Cluster configuration as JSON.
        config: String,

        /// Port reported in the agent's debug logs (nothing is bound to it).
        #[arg(long)]
        debug_port: Option<u16>,
    },

    /// App worker entry point (spawned by the master).
    #[command(hide = true)]
    AppWorker {
        /// Cluster configuration as JSON.
        config: String,

        #[arg(long)]
        worker_id: u32,
    },
}

#[derive(clap::Args, Debug)]
struct StartArgs {
    /// Application base directory (defaults to the current directory).
    #[arg(long, env = "TROUPE_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Framework reference.
    #[arg(long, env = "TROUPE_FRAMEWORK")]
    framework: Option<String>,

    /// Number of app workers (defaults to the number of CPUs).
    #[arg(long, env = "TROUPE_WORKERS")]
    workers: Option<usize>,

    /// Application port.
    #[arg(long, env = "TROUPE_PORT")]
    port: Option<u16>,

    /// Route connections through a sticky worker port.
    #[arg(long)]
    sticky: bool,

    /// TLS private key (PEM). Enables https together with `--https-cert`.
    #[arg(long, requires = "https_cert")]
    https_key: Option<PathBuf>,

    /// TLS certificate (PEM).
    #[arg(long, requires = "https_key")]
    https_cert: Option<PathBuf>,

    /// TLS CA bundle (PEM).
    #[arg(long, requires = "https_key")]
    https_ca: Option<PathBuf>,

    /// Start the agent at debug log level, tagged with its debug port.
    #[arg(long)]
    debug: bool,

    /// Module preloaded by every worker before construction (repeatable).
    #[arg(long = "require")]
    require: Vec<String>,

    /// Write the master pid to this file.
    #[arg(long, env = "TROUPE_PID_FILE")]
    pid_file: Option<PathBuf>,

    /// Exchange envelopes with a parent process over stdin/stdout.
    #[arg(long)]
    parent_ipc: bool,
}

impl StartArgs {
    fn into_options(self) -> ClusterOptions {
        let https = match (self.https_key, self.https_cert) {
            (Some(key), Some(cert)) => Some(TlsConfig {
                key,
                cert,
                ca: self.https_ca,
            }),
            _ => None,
        };
        ClusterOptions {
            base_dir: self.base_dir,
            framework: self.framework,
            workers: self.workers,
            port: self.port,
            sticky: self.sticky,
            https,
            is_debug: self.debug,
            require: self.require,
            pid_file: self.pid_file,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let framework: Arc<dyn Framework> = Arc::new(BasicFramework::new());

    match args.command {
        Command::Start(start) => {
            init_tracing(&role_filter(LOG_TARGETS, MASTER_LEVEL_ENV, "INFO"), args.log_json);
            let parent_ipc = start.parent_ipc;
            let config = start.into_options().resolve()?;
            let options = MasterOptions {
                parent_ipc,
                ..MasterOptions::from_env()?
            };

            let master = Master::new(config, framework, options)?;
            let result = master
                .run(async {
                    if let Err(e) = wait_for_shutdown_signal().await {
                        error!(error = %e, "Failed to install signal handlers");
                        std::future::pending::<()>().await;
                    }
                })
                .await;
            if let Err(e) = &result {
                error!(error = %e, "[master] exiting with code:1");
            }
            result?;
            info!("[master] stopped");
        }
        Command::AgentWorker { config, debug_port } => {
            let fallback = if debug_port.is_some() { "DEBUG" } else { "INFO" };
            init_tracing(&role_filter(LOG_TARGETS, AGENT_LEVEL_ENV, fallback), args.log_json);
            run_agent_worker(framework, &config, debug_port).await?;
        }
        Command::AppWorker { config, worker_id } => {
            init_tracing(&role_filter(LOG_TARGETS, APP_LEVEL_ENV, "INFO"), args.log_json);
            run_app_worker(framework, &config, worker_id).await?;
        }
    }
    Ok(())
}
