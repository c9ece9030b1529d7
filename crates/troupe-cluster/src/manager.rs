//! Process registry for the agent and the app workers.
//!
//! Tracks one agent handle and the app worker handles keyed by worker id,
//! and runs the periodic health check that escalates when the topology
//! stays incomplete.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use troupe_core::ChannelSender;

pub use crate::error::WorkerCount;

/// Default interval between health-check ticks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive failing ticks that trigger an escalation.
pub const ESCALATION_THRESHOLD: u32 = 3;

/// Lifecycle status of a spawned child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Connection state of an app worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Listening,
    Disconnected,
}

/// A spawned child and its IPC channel.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub id: u32,
    pub pid: u32,
    pub status: ProcessStatus,
    pub channel: ChannelSender,
}

impl ProcessHandle {
    pub const fn new(id: u32, pid: u32, channel: ChannelSender) -> Self {
        Self {
            id,
            pid,
            status: ProcessStatus::Starting,
            channel,
        }
    }
}

/// An app worker tracked by the registry.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub process: ProcessHandle,
    pub state: WorkerState,
}

impl WorkerHandle {
    pub const fn new(process: ProcessHandle) -> Self {
        Self {
            process,
            state: WorkerState::Starting,
        }
    }
}

/// Consecutive-failure counter behind the health check.
///
/// A healthy tick resets the count; the third consecutive unhealthy tick
/// escalates once, after which the counter is spent.
#[derive(Debug, Default)]
pub struct HealthCounter {
    failures: u32,
    spent: bool,
}

impl HealthCounter {
    pub const fn new() -> Self {
        Self {
            failures: 0,
            spent: false,
        }
    }

    /// Feed one tick; returns the count to escalate with, at most once.
    pub const fn observe(&mut self, count: WorkerCount) -> Option<WorkerCount> {
        if self.spent {
            return None;
        }
        if count.agent > 0 && count.worker > 0 {
            self.failures = 0;
            return None;
        }
        self.failures += 1;
        if self.failures >= ESCALATION_THRESHOLD {
            self.spent = true;
            return Some(count);
        }
        None
    }

    pub const fn failures(&self) -> u32 {
        self.failures
    }

    pub const fn is_spent(&self) -> bool {
        self.spent
    }
}

/// Registry of the agent and app worker handles.
#[derive(Default)]
pub struct Manager {
    agent: RwLock<Option<ProcessHandle>>,
    workers: RwLock<BTreeMap<u32, WorkerHandle>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the agent handle.
    pub async fn set_agent(&self, agent: ProcessHandle) {
        *self.agent.write().await = Some(agent);
    }

    pub async fn delete_agent(&self) -> Option<ProcessHandle> {
        self.agent.write().await.take()
    }

    /// Update the agent status; returns `false` if no agent is tracked.
    pub async fn set_agent_status(&self, status: ProcessStatus) -> bool {
        let mut agent = self.agent.write().await;
        agent.as_mut().is_some_and(|a| {
            a.status = status;
            true
        })
    }

    pub async fn agent(&self) -> Option<ProcessHandle> {
        self.agent.read().await.clone()
    }

    pub async fn agent_pid(&self) -> Option<u32> {
        self.agent.read().await.as_ref().map(|a| a.pid)
    }

    pub async fn set_worker(&self, worker: WorkerHandle) {
        let id = worker.process.id;
        self.workers.write().await.insert(id, worker);
    }

    pub async fn get_worker(&self, id: u32) -> Option<WorkerHandle> {
        self.workers.read().await.get(&id).cloned()
    }

    pub async fn delete_worker(&self, id: u32) -> Option<WorkerHandle> {
        self.workers.write().await.remove(&id)
    }

    /// Update a worker's state; returns `false` if the id is unknown.
    pub async fn set_worker_state(&self, id: u32, state: WorkerState) -> bool {
        let mut workers = self.workers.write().await;
        workers.get_mut(&id).is_some_and(|w| {
            w.state = state;
            true
        })
    }

    /// Update a worker's process status; returns `false` if the id is unknown.
    pub async fn set_worker_status(&self, id: u32, status: ProcessStatus) -> bool {
        let mut workers = self.workers.write().await;
        workers.get_mut(&id).is_some_and(|w| {
            w.process.status = status;
            true
        })
    }

    pub async fn list_worker_ids(&self) -> Vec<u32> {
        self.workers.read().await.keys().copied().collect()
    }

    pub async fn listening_worker_ids(&self) -> Vec<u32> {
        self.workers
            .read()
            .await
            .iter()
            .filter(|(_, w)| w.state == WorkerState::Listening)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Channels of workers that are still connected, optionally narrowed to one pid.
    pub async fn worker_channels(&self, receiver_pid: Option<&str>) -> Vec<ChannelSender> {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.state != WorkerState::Disconnected)
            .filter(|w| receiver_pid.is_none_or(|pid| pid == w.process.pid.to_string()))
            .map(|w| w.process.channel.clone())
            .collect()
    }

    /// Pids of every tracked child, agent first.
    pub async fn child_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.agent.read().await.iter().map(|a| a.pid).collect();
        pids.extend(self.workers.read().await.values().map(|w| w.process.pid));
        pids
    }

    /// Mark every tracked child with `status`.
    pub async fn set_all_status(&self, status: ProcessStatus) {
        self.set_agent_status(status).await;
        for worker in self.workers.write().await.values_mut() {
            worker.process.status = status;
        }
    }

    /// `agent` is 1 only for a started agent; `worker` counts every tracked worker.
    pub async fn count(&self) -> WorkerCount {
        let agent = self
            .agent
            .read()
            .await
            .as_ref()
            .is_some_and(|a| a.status == ProcessStatus::Started);
        WorkerCount {
            agent: usize::from(agent),
            worker: self.workers.read().await.len(),
        }
    }

    /// Start the periodic liveness check.
    ///
    /// The returned task resolves with the registry counts when the
    /// topology stayed incomplete for [`ESCALATION_THRESHOLD`] ticks.
    /// Aborting the handle stops the check.
    pub fn start_check(self: &Arc<Self>, interval: Duration) -> JoinHandle<WorkerCount> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick
            let mut counter = HealthCounter::new();
            loop {
                ticker.tick().await;
                let count = manager.count().await;
                if let Some(count) = counter.observe(count) {
                    error!(agent = count.agent, worker = count.worker, "health check escalated");
                    return count;
                }
                if counter.failures() > 0 {
                    warn!(
                        agent = count.agent,
                        worker = count.worker,
                        failures = counter.failures(),
                        "cluster incomplete"
                    );
                } else {
                    debug!(agent = count.agent, worker = count.worker, "health check ok");
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn handle(id: u32, pid: u32) -> ProcessHandle {
        ProcessHandle::new(id, pid, ChannelSender::detached(format!("test-{id}")).0)
    }

    const HEALTHY: WorkerCount = WorkerCount { agent: 1, worker: 2 };
    const NO_AGENT: WorkerCount = WorkerCount { agent: 0, worker: 2 };
    const NO_WORKERS: WorkerCount = WorkerCount { agent: 1, worker: 0 };

    #[test]
    fn counter_resets_on_healthy_tick() {
        let mut counter = HealthCounter::new();
        assert_eq!(counter.observe(NO_AGENT), None);
        assert_eq!(counter.observe(NO_WORKERS), None);
        assert_eq!(counter.failures(), 2);
        assert_eq!(counter.observe(HEALTHY), None);
        assert_eq!(counter.failures(), 0);
    }

    #[test]
    fn counter_escalates_exactly_once() {
        let mut counter = HealthCounter::new();
        assert_eq!(counter.observe(NO_AGENT), None);
        assert_eq!(counter.observe(NO_AGENT), None);
        assert_eq!(counter.observe(NO_WORKERS), Some(NO_WORKERS));
        assert!(counter.is_spent());
        for _ in 0..5 {
            assert_eq!(counter.observe(NO_AGENT), None);
        }
        assert_eq!(counter.observe(HEALTHY), None);
        assert!(counter.is_spent());
    }

    #[tokio::test]
    async fn count_only_includes_started_agent() {
        let manager = Manager::new();
        assert_eq!(manager.count().await, WorkerCount::default());

        manager.set_agent(handle(1, 100)).await;
        assert_eq!(manager.count().await.agent, 0);
        assert!(manager.set_agent_status(ProcessStatus::Started).await);
        assert_eq!(manager.count().await, WorkerCount { agent: 1, worker: 0 });

        manager.set_worker(WorkerHandle::new(handle(1, 101))).await;
        manager.set_worker(WorkerHandle::new(handle(2, 102))).await;
        assert_eq!(manager.count().await, WorkerCount { agent: 1, worker: 2 });

        manager.delete_agent().await;
        assert_eq!(manager.count().await, WorkerCount { agent: 0, worker: 2 });
        assert!(!manager.set_agent_status(ProcessStatus::Started).await);
    }

    #[tokio::test]
    async fn worker_bookkeeping() {
        let manager = Manager::new();
        manager.set_worker(WorkerHandle::new(handle(2, 202))).await;
        manager.set_worker(WorkerHandle::new(handle(1, 201))).await;
        assert_eq!(manager.list_worker_ids().await, vec![1, 2]);
        assert!(manager.listening_worker_ids().await.is_empty());

        assert!(manager.set_worker_state(2, WorkerState::Listening).await);
        assert!(!manager.set_worker_state(9, WorkerState::Listening).await);
        assert_eq!(manager.listening_worker_ids().await, vec![2]);
        assert_eq!(manager.get_worker(2).await.unwrap().process.pid, 202);

        manager.delete_worker(2).await;
        assert!(manager.get_worker(2).await.is_none());
        assert_eq!(manager.list_worker_ids().await, vec![1]);
    }

    #[tokio::test]
    async fn worker_channels_skip_disconnected_and_filter_pid() {
        let manager = Manager::new();
        manager.set_worker(WorkerHandle::new(handle(1, 301))).await;
        manager.set_worker(WorkerHandle::new(handle(2, 302))).await;
        manager.set_worker(WorkerHandle::new(handle(3, 303))).await;
        manager.set_worker_state(3, WorkerState::Disconnected).await;

        let all: Vec<String> = manager
            .worker_channels(None)
            .await
            .iter()
            .map(|c| c.label().to_string())
            .collect();
        assert_eq!(all, vec!["test-1", "test-2"]);

        let one = manager.worker_channels(Some("302")).await;
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].label(), "test-2");
        assert!(manager.worker_channels(Some("303")).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_check_escalates_after_three_ticks() {
        let manager = Arc::new(Manager::new());
        manager.set_agent(handle(1, 100)).await;
        let check = manager.start_check(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!check.is_finished());

        let count = check.await.unwrap();
        assert_eq!(count, WorkerCount { agent: 0, worker: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn start_check_stays_quiet_while_healthy() {
        let manager = Arc::new(Manager::new());
        manager.set_agent(handle(1, 100)).await;
        manager.set_agent_status(ProcessStatus::Started).await;
        manager.set_worker(WorkerHandle::new(handle(1, 101))).await;
        let check = manager.start_check(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!check.is_finished());
        check.abort();
    }
}
