//! Framework provider interface.
//!
//! The cluster never knows what an application or agent does; it only
//! constructs them through a [`Framework`], waits for [`Instance::ready`],
//! watches [`Instance::events`] and finally calls [`Instance::close`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::readiness::{Boot, Lifecycle, LifecycleEvent, ReadyError};

/// Which capability set an instance was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Application,
    Agent,
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => f.write_str("application"),
            Self::Agent => f.write_str("agent"),
        }
    }
}

/// A constructed application or agent.
#[async_trait]
pub trait Instance: Send + Sync {
    fn kind(&self) -> InstanceKind;

    /// Resolves once the instance is ready, yielding the first readiness error.
    async fn ready(&self) -> std::result::Result<(), ReadyError>;

    /// Subscribe to lifecycle events. Dropping the receiver unsubscribes.
    fn events(&self) -> broadcast::Receiver<LifecycleEvent>;

    /// Release resources. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// Provider of the Application and Agent capability sets.
pub trait Framework: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Load a named module before anything is constructed.
    fn preload(&self, module: &str) -> Result<()>;

    /// Construct the agent. Must be called within a tokio runtime.
    fn create_agent(&self, config: &ClusterConfig) -> Result<Arc<dyn Instance>>;

    /// Construct the application for one app worker. Must be called within a tokio runtime.
    fn create_application(
        &self,
        config: &ClusterConfig,
        worker_id: u32,
    ) -> Result<Arc<dyn Instance>>;
}

type PreloadHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Framework whose instances are a bare [`Lifecycle`] plus configured boot hooks.
#[derive(Clone, Default)]
pub struct BasicFramework {
    agent_boots: Vec<Arc<dyn Boot>>,
    app_boots: Vec<Arc<dyn Boot>>,
    modules: HashMap<String, PreloadHook>,
}

impl BasicFramework {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_agent_boot(mut self, boot: Arc<dyn Boot>) -> Self {
        self.agent_boots.push(boot);
        self
    }

    #[must_use]
    pub fn with_app_boot(mut self, boot: Arc<dyn Boot>) -> Self {
        self.app_boots.push(boot);
        self
    }

    /// Register a module that `preload` can resolve.
    #[must_use]
    pub fn with_module<F>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.modules.insert(name.into(), Arc::new(hook));
        self
    }

    fn build(kind: InstanceKind, boots: &[Arc<dyn Boot>]) -> Result<Arc<dyn Instance>> {
        let lifecycle = Lifecycle::from_env()?;
        for boot in boots {
            lifecycle.add_boot(Arc::clone(boot));
        }
        lifecycle.start();
        debug!(%kind, boots = boots.len(), "instance constructed");
        Ok(Arc::new(BasicInstance {
            kind,
            lifecycle,
            closed: AtomicBool::new(false),
        }))
    }
}

impl Framework for BasicFramework {
    fn name(&self) -> &str {
        crate::config::DEFAULT_FRAMEWORK
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn preload(&self, module: &str) -> Result<()> {
        let hook = self
            .modules
            .get(module)
            .ok_or_else(|| Error::Framework(format!("Cannot find module '{module}'")))?;
        hook()?;
        info!(module, "module preloaded");
        Ok(())
    }

    fn create_agent(&self, _config: &ClusterConfig) -> Result<Arc<dyn Instance>> {
        Self::build(InstanceKind::Agent, &self.agent_boots)
    }

    fn create_application(
        &self,
        _config: &ClusterConfig,
        _worker_id: u32,
    ) -> Result<Arc<dyn Instance>> {
        Self::build(InstanceKind::Application, &self.app_boots)
    }
}

/// Instance produced by [`BasicFramework`].
pub struct BasicInstance {
    kind: InstanceKind,
    lifecycle: Lifecycle,
    closed: AtomicBool,
}

impl BasicInstance {
    pub const fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

#[async_trait]
impl Instance for BasicInstance {
    fn kind(&self) -> InstanceKind {
        self.kind
    }

    async fn ready(&self) -> std::result::Result<(), ReadyError> {
        self.lifecycle.ready().await
    }

    fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(kind = %self.kind, "instance closed");
        }
        Ok(())
    }
}
