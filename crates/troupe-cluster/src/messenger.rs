//! Message router between the master, its parent, the agent and the app workers.
//!
//! ## Rules
//! - `from` defaults to `master`.
//! - `receiverPid` overrides `to`: the master's own pid routes to the master,
//!   the agent's pid to the agent, any other pid to the app workers.
//! - A missing `to` follows the adjacency table (agent → app, app → agent,
//!   parent → master).
//! - Delivery is fire-and-forget: at most once and FIFO per channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

use troupe_core::{Action, ChannelSender, Endpoint, Envelope};

use crate::manager::Manager;

const BUS_CAPACITY: usize = 64;

/// Master-local bus with one broadcast channel per action.
///
/// Publishing an action nobody subscribed to drops the envelope.
#[derive(Debug, Default)]
pub struct ActionBus {
    channels: Mutex<HashMap<Action, broadcast::Sender<Envelope>>>,
}

impl ActionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive envelopes published for `action` from now on.
    pub fn subscribe(&self, action: Action) -> broadcast::Receiver<Envelope> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(action)
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .subscribe()
    }

    /// Publish an envelope to the subscribers of its action.
    pub fn publish(&self, envelope: Envelope) {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        match channels.get(&envelope.action) {
            Some(tx) => {
                let _ = tx.send(envelope);
            }
            None => debug!(action = %envelope.action, "no master listener for action"),
        }
    }
}

/// Routes envelopes to their destination channel.
pub struct Messenger {
    own_pid: u32,
    manager: Arc<Manager>,
    parent: Option<ChannelSender>,
    has_parent: AtomicBool,
    bus: ActionBus,
}

impl Messenger {
    pub fn new(own_pid: u32, manager: Arc<Manager>, parent: Option<ChannelSender>) -> Self {
        Self {
            own_pid,
            manager,
            has_parent: AtomicBool::new(parent.is_some()),
            parent,
            bus: ActionBus::new(),
        }
    }

    pub const fn bus(&self) -> &ActionBus {
        &self.bus
    }

    pub fn has_parent(&self) -> bool {
        self.has_parent.load(Ordering::SeqCst)
    }

    /// The parent went away; parent-bound envelopes are dropped from now on.
    pub fn parent_disconnected(&self) {
        if self.has_parent.swap(false, Ordering::SeqCst) {
            debug!("parent channel closed");
        }
    }

    /// Fill in `from` and `to`, returning the resolved destination.
    pub async fn route(&self, envelope: &mut Envelope) -> Option<Endpoint> {
        let from = *envelope.from.get_or_insert(Endpoint::Master);

        if let Some(pid) = envelope.receiver_pid.as_deref() {
            let to = if pid == self.own_pid.to_string() {
                Endpoint::Master
            } else if self
                .manager
                .agent_pid()
                .await
                .is_some_and(|agent| pid == agent.to_string())
            {
                Endpoint::Agent
            } else {
                Endpoint::App
            };
            envelope.to = Some(to);
        }

        if envelope.to.is_none() {
            envelope.to = from.adjacent();
        }
        envelope.to
    }

    /// Route and deliver one envelope; returns where it was sent.
    pub async fn send(&self, mut envelope: Envelope) -> Option<Endpoint> {
        let to = self.route(&mut envelope).await;
        match to {
            Some(Endpoint::Master) => self.bus.publish(envelope),
            Some(Endpoint::Parent) => self.send_to_parent(&envelope),
            Some(Endpoint::App | Endpoint::Worker) => self.send_to_app_workers(&envelope).await,
            Some(Endpoint::Agent) => self.send_to_agent(&envelope).await,
            None => debug!(
                action = %envelope.action,
                from = ?envelope.from,
                "dropping unroutable envelope"
            ),
        }
        to
    }

    fn send_to_parent(&self, envelope: &Envelope) {
        if !self.has_parent() {
            return;
        }
        if let Some(parent) = &self.parent
            && !parent.send(envelope)
        {
            self.parent_disconnected();
        }
    }

    async fn send_to_app_workers(&self, envelope: &Envelope) {
        let channels = self
            .manager
            .worker_channels(envelope.receiver_pid.as_deref())
            .await;
        debug!(action = %envelope.action, workers = channels.len(), "sending to app workers");
        for channel in channels {
            channel.send(envelope);
        }
    }

    async fn send_to_agent(&self, envelope: &Envelope) {
        match self.manager.agent().await {
            Some(agent) => {
                agent.channel.send(envelope);
            }
            None => debug!(action = %envelope.action, "no agent to deliver to"),
        }
    }
}
