//! Cluster configuration resolution for troupe.
//!
//! Startup options are resolved in one pass:
//! 1. Built-in defaults (base dir = cwd, workers = available parallelism)
//! 2. Caller-supplied [`ClusterOptions`] (CLI arguments, embedding code)
//! 3. Validation (directories and TLS material must exist)
//!
//! The resolved [`ClusterConfig`] is immutable and is handed to every
//! worker process serialized as a single JSON argument.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Framework reference used when none is configured.
pub const DEFAULT_FRAMEWORK: &str = "troupe";

/// Port used for TLS listeners when no explicit port is configured.
pub const DEFAULT_HTTPS_PORT: u16 = 8443;

/// Readiness task timeout when `TROUPE_READY_TIMEOUT` is unset.
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 10_000;

/// Agent debug port when `TROUPE_AGENT_DEBUG_PORT` is unset.
pub const DEFAULT_AGENT_DEBUG_PORT: u16 = 5800;

/// Env var overriding the readiness task timeout (milliseconds).
pub const READY_TIMEOUT_ENV: &str = "TROUPE_READY_TIMEOUT";
/// Env var overriding the agent debug port.
pub const AGENT_DEBUG_PORT_ENV: &str = "TROUPE_AGENT_DEBUG_PORT";
/// Env var selecting the deployment environment.
pub const SERVER_ENV: &str = "TROUPE_SERVER_ENV";
/// Fallback deployment selector consulted when [`SERVER_ENV`] is unset.
pub const FALLBACK_ENV: &str = "TROUPE_ENV";

/// TLS material for the application listeners.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub key: PathBuf,
    pub cert: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<PathBuf>,
}

/// Fully resolved cluster configuration.
///
/// Serialized in camelCase; the spawn contract relies on at least
/// `framework`, `baseDir` and `require` being present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub base_dir: PathBuf,
    pub framework: String,
    pub workers: usize,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub sticky_worker_port: Option<u16>,
    #[serde(default)]
    pub cluster_port: Option<u16>,
    #[serde(default)]
    pub https: Option<TlsConfig>,
    #[serde(default)]
    pub is_debug: bool,
    #[serde(default)]
    pub require: Vec<String>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

impl ClusterConfig {
    /// Listener protocol derived from the TLS material.
    pub const fn protocol(&self) -> &'static str {
        if self.https.is_some() { "https" } else { "http" }
    }

    /// Serialize into the single positional argument handed to workers.
    pub fn to_arg(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the positional argument produced by [`Self::to_arg`].
    pub fn from_arg(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("Failed to parse worker configuration: {e}")))
    }

    /// Returns a copy carrying the ports detected at master startup.
    #[must_use]
    pub fn with_detected_ports(
        mut self,
        cluster_port: u16,
        sticky_worker_port: Option<u16>,
    ) -> Self {
        self.cluster_port = Some(cluster_port);
        if self.sticky {
            self.sticky_worker_port = sticky_worker_port;
        }
        self
    }

    /// Check invariants that must hold before any process is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.framework.trim().is_empty() {
            return Err(Error::Config("framework reference must not be empty".into()));
        }
        if !self.base_dir.is_dir() {
            return Err(Error::Config(format!(
                "Directory {} does not exist or is not a directory",
                self.base_dir.display()
            )));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if let Some(tls) = &self.https {
            require_file(&tls.key, "https.key")?;
            require_file(&tls.cert, "https.cert")?;
            if let Some(ca) = &tls.ca {
                require_file(ca, "https.ca")?;
            }
        }
        Ok(())
    }
}

fn require_file(path: &Path, label: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::Config(format!("{label} {} should exist", path.display())))
    }
}

/// Raw startup options before defaults are applied.
#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    pub base_dir: Option<PathBuf>,
    pub framework: Option<String>,
    pub workers: Option<usize>,
    pub port: Option<u16>,
    pub sticky: bool,
    pub https: Option<TlsConfig>,
    pub is_debug: bool,
    pub require: Vec<String>,
    pub pid_file: Option<PathBuf>,
}

impl ClusterOptions {
    /// Apply defaults and validate, producing the immutable configuration.
    pub fn resolve(self) -> Result<ClusterConfig> {
        let base_dir = match self.base_dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let workers = match self.workers {
            Some(n) if n > 0 => n,
            _ => std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        };
        let port = match (self.port, &self.https) {
            (Some(port), _) => Some(port),
            (None, Some(_)) => Some(DEFAULT_HTTPS_PORT),
            (None, None) => None,
        };

        let config = ClusterConfig {
            base_dir,
            framework: self
                .framework
                .unwrap_or_else(|| DEFAULT_FRAMEWORK.to_string()),
            workers,
            port,
            sticky: self.sticky,
            sticky_worker_port: None,
            cluster_port: None,
            https: self.https,
            is_debug: self.is_debug,
            require: self.require,
            pid_file: self.pid_file,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Deployment mode; only production runs the periodic health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deployment {
    Local,
    Production,
}

impl Deployment {
    /// Classify from the raw values of [`SERVER_ENV`] and [`FALLBACK_ENV`].
    pub fn detect(server_env: Option<&str>, fallback_env: Option<&str>) -> Self {
        match server_env {
            Some("local" | "unittest") => Self::Local,
            Some(_) => Self::Production,
            None if fallback_env == Some("production") => Self::Production,
            None => Self::Local,
        }
    }

    /// Classify from the process environment.
    pub fn from_env() -> Self {
        Self::detect(
            std::env::var(SERVER_ENV).ok().as_deref(),
            std::env::var(FALLBACK_ENV).ok().as_deref(),
        )
    }

    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Parse a readiness timeout override; `None` yields the default.
pub fn parse_ready_timeout(raw: Option<&str>) -> Result<Duration> {
    let Some(raw) = raw else {
        return Ok(Duration::from_millis(DEFAULT_READY_TIMEOUT_MS));
    };
    raw.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| {
        Error::Config(format!(
            "{READY_TIMEOUT_ENV} {raw} should be able to parse as an integer"
        ))
    })
}

/// Readiness timeout from the process environment.
pub fn ready_timeout_from_env() -> Result<Duration> {
    parse_ready_timeout(std::env::var(READY_TIMEOUT_ENV).ok().as_deref())
}

/// Agent debug port from the process environment, falling back to the default.
pub fn agent_debug_port_from_env() -> u16 {
    std::env::var(AGENT_DEBUG_PORT_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_AGENT_DEBUG_PORT)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn options_in(dir: &Path) -> ClusterOptions {
        ClusterOptions {
            base_dir: Some(dir.to_path_buf()),
            ..ClusterOptions::default()
        }
    }

    #[test]
    fn resolve_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = options_in(dir.path()).resolve().unwrap();
        assert_eq!(config.framework, DEFAULT_FRAMEWORK);
        assert!(config.workers >= 1);
        assert_eq!(config.port, None);
        assert_eq!(config.protocol(), "http");
        assert!(config.require.is_empty());
    }

    #[test]
    fn resolve_defaults_https_port() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("server.key");
        let cert = dir.path().join("server.crt");
        std::fs::write(&key, "key").unwrap();
        std::fs::write(&cert, "cert").unwrap();

        let mut options = options_in(dir.path());
        options.https = Some(TlsConfig { key, cert, ca: None });
        let config = options.resolve().unwrap();
        assert_eq!(config.port, Some(DEFAULT_HTTPS_PORT));
        assert_eq!(config.protocol(), "https");
    }

    #[test]
    fn resolve_rejects_missing_tls_material() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options_in(dir.path());
        options.https = Some(TlsConfig {
            key: dir.path().join("missing.key"),
            cert: dir.path().join("missing.crt"),
            ca: None,
        });
        let err = options.resolve().unwrap_err();
        assert!(err.to_string().contains("https.key"));
    }

    #[test]
    fn resolve_rejects_missing_base_dir() {
        let options = ClusterOptions {
            base_dir: Some(PathBuf::from("/definitely/not/here")),
            ..ClusterOptions::default()
        };
        assert!(matches!(options.resolve(), Err(Error::Config(_))));
    }

    #[test]
    fn arg_carries_spawn_contract_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options_in(dir.path());
        options.require = vec!["instrumentation".into()];
        options.workers = Some(2);
        let config = options.resolve().unwrap();

        let raw: serde_json::Value = serde_json::from_str(&config.to_arg().unwrap()).unwrap();
        assert!(raw.get("framework").is_some());
        assert!(raw.get("baseDir").is_some());
        assert_eq!(raw["require"][0], "instrumentation");
        assert_eq!(ClusterConfig::from_arg(&config.to_arg().unwrap()).unwrap(), config);
    }

    #[test]
    fn from_arg_rejects_garbage() {
        assert!(matches!(
            ClusterConfig::from_arg("not json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn sticky_port_only_applied_in_sticky_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = options_in(dir.path()).resolve().unwrap();
        let detected = config.with_detected_ports(7001, Some(7002));
        assert_eq!(detected.cluster_port, Some(7001));
        assert_eq!(detected.sticky_worker_port, None);
    }

    #[test]
    fn deployment_detection() {
        assert_eq!(Deployment::detect(Some("local"), None), Deployment::Local);
        assert_eq!(Deployment::detect(Some("unittest"), Some("production")), Deployment::Local);
        assert_eq!(Deployment::detect(Some("prod"), None), Deployment::Production);
        assert_eq!(Deployment::detect(None, Some("production")), Deployment::Production);
        assert_eq!(Deployment::detect(None, None), Deployment::Local);
    }

    #[test]
    fn ready_timeout_parsing() {
        assert_eq!(parse_ready_timeout(None).unwrap(), Duration::from_secs(10));
        assert_eq!(parse_ready_timeout(Some("250")).unwrap(), Duration::from_millis(250));
        assert!(parse_ready_timeout(Some("soon")).is_err());
    }
}
