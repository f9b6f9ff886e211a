//! Node-to-policy bindings and rebind requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::boot::ArtifactKind;
use crate::error::EngineResult;
use crate::fsm::{Machine, State};
use crate::models::{Command, Node, Policy};
use crate::templates::{CallbackReply, Model, TemplateDriver};

/// The live model instance bound to one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveModel {
    /// Identifier.
    pub uuid: String,
    /// Bound node.
    pub node_uuid: String,
    /// Policy that produced the binding.
    pub policy_uuid: String,
    /// Label of that policy at bind time.
    #[serde(default)]
    pub label: String,
    /// Snapshot of the model at bind time.
    pub model: Model,
    /// FSM state and history.
    #[serde(default)]
    pub machine: Machine,
    /// Per-policy binding sequence number.
    pub counter: u64,
    /// Broker handoff target copied from the policy.
    #[serde(default)]
    pub broker: Option<String>,
    /// IP address reported by the installed OS.
    #[serde(default)]
    pub node_ip: Option<String>,
    /// When the binding was made.
    pub bind_timestamp: DateTime<Utc>,
    /// Store version.
    #[serde(default)]
    pub version: u64,
}

impl ActiveModel {
    /// Bind `node` to `policy`'s `model` using sequence number `counter`.
    #[must_use]
    pub fn bind(node: &Node, policy: &Policy, model: Model, counter: u64) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            node_uuid: node.uuid.clone(),
            policy_uuid: policy.uuid.clone(),
            label: policy.label.clone(),
            model,
            machine: Machine::new(),
            counter,
            broker: policy.broker.clone(),
            node_ip: None,
            bind_timestamp: Utc::now(),
            version: 0,
        }
    }

    /// Current FSM state.
    #[must_use]
    pub fn current_state(&self) -> State {
        self.machine.state
    }

    /// Hostname assigned to the bound node.
    #[must_use]
    pub fn hostname(&self) -> String {
        self.model.hostname(self.counter)
    }

    /// Whether the template reached a completion state.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.driver().transitions().is_terminal(self.machine.state)
    }

    fn driver(&self) -> &'static dyn TemplateDriver {
        self.model.template.driver()
    }

    /// Agent checkin while bound.
    pub fn on_checkin(&mut self) -> Command {
        let driver = self.driver();
        driver.on_checkin(&mut self.machine)
    }

    /// Boot request while bound.
    pub fn on_boot_request(&mut self) -> ArtifactKind {
        let driver = self.driver();
        driver.on_boot_request(&mut self.machine)
    }

    /// Installer progress report.
    ///
    /// # Errors
    /// Propagates the driver's error for an unknown namespace or argument.
    pub fn callback(&mut self, namespace: &str, args: &[String]) -> EngineResult<CallbackReply> {
        let driver = self.driver();
        let reply = driver.on_callback(&mut self.machine, namespace, args)?;
        if let CallbackReply::RecordIp(ip) = &reply {
            self.node_ip = Some(ip.clone());
        }
        Ok(reply)
    }
}

/// Pending operator request to re-evaluate in-memory policies on next boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebindRequest {
    /// Identifier.
    pub uuid: String,
    /// Node the request applies to.
    pub node_uuid: String,
    /// When it was requested.
    pub timestamp: DateTime<Utc>,
    /// Store version.
    #[serde(default)]
    pub version: u64,
}

impl RebindRequest {
    /// A request for `node_uuid`, stamped now.
    #[must_use]
    pub fn new(node_uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            node_uuid: node_uuid.into(),
            timestamp: Utc::now(),
            version: 0,
        }
    }
}
