//! Addressed message envelope exchanged between cluster members.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Logical endpoint of the cluster topology.
///
/// `Worker` is an alias of `App` kept for wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Master,
    Parent,
    Agent,
    App,
    Worker,
}

impl Endpoint {
    /// Default destination for envelopes that name only a sender.
    pub const fn adjacent(self) -> Option<Self> {
        match self {
            Self::Agent => Some(Self::App),
            Self::App | Self::Worker => Some(Self::Agent),
            Self::Parent => Some(Self::Master),
            Self::Master => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Master => "master",
            Self::Parent => "parent",
            Self::Agent => "agent",
            Self::App => "app",
            Self::Worker => "worker",
        };
        f.write_str(name)
    }
}

/// Action carried by an envelope.
///
/// Known actions have dedicated variants; anything else is preserved
/// verbatim in [`Action::Other`] and routed like any other message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// Broadcast by the master once the cluster is ready.
    EggReady,
    /// Sent by the agent once its instance is ready.
    AgentStart,
    /// Sent by an app worker once its instance is ready.
    AppStart,
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Self::EggReady => "egg-ready",
            Self::AgentStart => "agent-start",
            Self::AppStart => "app-start",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        match value.as_str() {
            "egg-ready" => Self::EggReady,
            "agent-start" => Self::AgentStart,
            "app-start" => Self::AppStart,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for Action {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Action> for String {
    fn from(value: Action) -> Self {
        match value {
            Action::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One routed message: `{ from?, to?, action, receiverPid?, data }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Endpoint>,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_pid: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Create an unaddressed envelope with no payload.
    pub fn new(action: impl Into<Action>) -> Self {
        Self {
            from: None,
            to: None,
            action: action.into(),
            receiver_pid: None,
            data: Value::Null,
        }
    }

    #[must_use]
    pub const fn sent_from(mut self, endpoint: Endpoint) -> Self {
        self.from = Some(endpoint);
        self
    }

    #[must_use]
    pub const fn addressed_to(mut self, endpoint: Endpoint) -> Self {
        self.to = Some(endpoint);
        self
    }

    #[must_use]
    pub fn with_receiver_pid(mut self, pid: impl ToString) -> Self {
        self.receiver_pid = Some(pid.to_string());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_actions_use_wire_names() {
        let envelope = Envelope::new(Action::AgentStart).addressed_to(Endpoint::Master);
        let raw = serde_json::to_value(envelope).unwrap();
        assert_eq!(raw, json!({"to": "master", "action": "agent-start", "data": null}));
    }

    #[test]
    fn unknown_actions_survive_a_trip() {
        let line = r#"{"action":"cache-flush","receiverPid":"42","data":{"k":1}}"#;
        let env: Envelope = serde_json::from_str(line).unwrap();
        assert_eq!(env.action, Action::Other("cache-flush".into()));
        assert_eq!(env.receiver_pid.as_deref(), Some("42"));
        assert_eq!(env.from, None);

        let back = serde_json::to_string(&env).unwrap();
        assert!(back.contains(r#""action":"cache-flush""#));
        assert!(back.contains(r#""receiverPid":"42""#));
    }

    #[test]
    fn adjacency_table() {
        assert_eq!(Endpoint::Agent.adjacent(), Some(Endpoint::App));
        assert_eq!(Endpoint::App.adjacent(), Some(Endpoint::Agent));
        assert_eq!(Endpoint::Worker.adjacent(), Some(Endpoint::Agent));
        assert_eq!(Endpoint::Parent.adjacent(), Some(Endpoint::Master));
        assert_eq!(Endpoint::Master.adjacent(), None);
    }
}
