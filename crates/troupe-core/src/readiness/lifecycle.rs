//! Two-phase readiness driver.
//!
//! Phase order: load-ready barrier, will-ready hooks, boot-ready barrier,
//! ready, did-ready hooks. A load-ready error skips straight to ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use super::barrier::{Barrier, EVENT_CAPACITY, LifecycleEvent, ReadyError, ReadyTask};
use crate::config::ready_timeout_from_env;
use crate::error::Result;

/// Boot hook participating in the readiness phases.
#[async_trait]
pub trait Boot: Send + Sync {
    fn name(&self) -> &str;

    /// Runs once the load-ready barrier is done. May register additional
    /// tasks on `boot_ready`; the boot-ready barrier waits for this hook too.
    async fn will_ready(&self, _boot_ready: &Barrier) -> std::result::Result<(), ReadyError> {
        Ok(())
    }

    /// Runs after the instance is ready, receiving the ready error if any.
    async fn did_ready(&self, _error: Option<&ReadyError>) -> std::result::Result<(), ReadyError> {
        Ok(())
    }
}

struct Inner {
    load: Barrier,
    boot: Barrier,
    boots: Mutex<Vec<Arc<dyn Boot>>>,
    events: broadcast::Sender<LifecycleEvent>,
    outcome: watch::Sender<Option<std::result::Result<(), ReadyError>>>,
    started: AtomicBool,
}

impl Inner {
    fn boots(&self) -> Vec<Arc<dyn Boot>> {
        self.boots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn trigger_will_ready(&self) {
        let boots = self.boots();
        let tasks: Vec<(Arc<dyn Boot>, ReadyTask)> = boots
            .into_iter()
            .map(|boot| {
                let task = self.boot.register(format!("{}:will_ready", boot.name()));
                (boot, task)
            })
            .collect();

        for (boot, task) in tasks {
            let barrier = self.boot.clone();
            tokio::spawn(async move {
                let result = boot.will_ready(&barrier).await;
                task.complete(result);
            });
        }
        self.boot.start();
    }

    async fn trigger_did_ready(&self, error: Option<&ReadyError>) {
        for boot in self.boots() {
            if let Err(e) = boot.did_ready(error).await {
                error!(boot = boot.name(), error = %e, "did_ready hook failed");
                let _ = self.events.send(LifecycleEvent::Error(e));
            }
        }
    }

    async fn drive(self: Arc<Self>) {
        let begin = Instant::now();
        let outcome = match self.load.ready().await {
            Ok(()) => {
                debug!("load ready, running will_ready hooks");
                self.trigger_will_ready();
                self.boot.ready().await
            }
            Err(e) => Err(e),
        };

        let elapsed_ms = u64::try_from(begin.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            Ok(()) => info!(elapsed_ms, "lifecycle ready"),
            Err(e) => error!(elapsed_ms, error = %e, "lifecycle ready with error"),
        }
        self.outcome.send_replace(Some(outcome.clone()));
        self.trigger_did_ready(outcome.as_ref().err()).await;
    }
}

/// Readiness lifecycle owned by every framework instance. Cheap to clone.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new(timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                load: Barrier::with_events("load_ready", timeout, events.clone()),
                boot: Barrier::with_events("boot_ready", timeout, events.clone()),
                boots: Mutex::new(Vec::new()),
                events,
                outcome,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Build with the timeout from `TROUPE_READY_TIMEOUT`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ready_timeout_from_env()?))
    }

    /// Register a boot hook. Hooks added after load-ready completes are
    /// skipped for will-ready but still run did-ready.
    pub fn add_boot(&self, boot: Arc<dyn Boot>) {
        self.inner
            .boots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(boot);
    }

    pub fn load_ready(&self) -> &Barrier {
        &self.inner.load
    }

    pub fn boot_ready(&self) -> &Barrier {
        &self.inner.boot
    }

    /// Register a task on the load-ready barrier.
    pub fn register(&self, id: impl Into<String>) -> ReadyTask {
        self.inner.load.register(id)
    }

    /// Start the lifecycle; later calls are no-ops.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.load.start();
        tokio::spawn(Arc::clone(&self.inner).drive());
    }

    /// Wait for the ready outcome.
    pub async fn ready(&self) -> std::result::Result<(), ReadyError> {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ReadyError::new("lifecycle dropped"))?
            .clone();
        outcome.unwrap_or(Ok(()))
    }

    pub fn is_ready(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Publish an error on the lifecycle event channel.
    ///
    /// Instances use this to report failures outside the boot hooks; the
    /// worker bootstrap treats an error emitted before ready as fatal.
    pub fn emit_error(&self, error: ReadyError) {
        error!(error = %error, "lifecycle error");
        let _ = self.inner.events.send(LifecycleEvent::Error(error));
    }
}
