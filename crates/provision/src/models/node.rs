//! Node records and hardware identity.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A physical or virtual host known to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Engine-assigned identifier.
    pub uuid: String,
    /// Hardware ids (SMBIOS uuid or NIC MACs). Disjoint across nodes.
    pub hw_ids: Vec<String>,
    /// State last reported by the booted agent.
    #[serde(default)]
    pub last_state: Option<String>,
    /// Time of the last checkin or registration.
    pub last_checkin: DateTime<Utc>,
    /// Facts reported at registration.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// MAC of the interface the node last PXE-booted from.
    #[serde(default)]
    pub dhcp_mac: Option<String>,
    /// Store version.
    #[serde(default)]
    pub version: u64,
}

impl Node {
    /// A fresh node owning `hw_ids`, stamped now.
    #[must_use]
    pub fn new(hw_ids: Vec<String>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            hw_ids,
            last_state: None,
            last_checkin: Utc::now(),
            attributes: BTreeMap::new(),
            dhcp_mac: None,
            version: 0,
        }
    }

    /// Key the microkernel uses to identify this node: the single hardware
    /// id, or all ids joined with `_`.
    #[must_use]
    pub fn hw_id_key(&self) -> String {
        self.hw_ids.join("_")
    }

    /// Whole seconds elapsed since the last checkin.
    #[must_use]
    pub fn seconds_since_checkin(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_checkin).num_seconds()
    }
}

/// Derived lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Checked in recently, not bound.
    Active,
    /// Not seen within the register timeout, not bound.
    Inactive,
    /// An ActiveModel is bound.
    Bound,
    /// A rebind request is pending.
    Rebind,
}

impl NodeStatus {
    /// Whether the expiry sweep must leave this node alone.
    #[must_use]
    pub fn is_protected(self) -> bool {
        matches!(self, Self::Bound | Self::Rebind)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Bound => "bound",
            Self::Rebind => "rebind",
        })
    }
}

/// Identifiers a booting node presents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareIdentity {
    /// SMBIOS uuid.
    #[serde(default)]
    pub uuid: Option<String>,
    /// NIC MAC addresses.
    #[serde(default)]
    pub mac_ids: Vec<String>,
}

impl HardwareIdentity {
    /// Build an identity, normalizing ids to trimmed upper case and
    /// dropping blanks.
    #[must_use]
    pub fn new(uuid: Option<&str>, mac_ids: &[&str]) -> Self {
        Self {
            uuid: uuid.and_then(normalize_id),
            mac_ids: mac_ids.iter().filter_map(|m| normalize_id(m)).collect(),
        }
    }

    /// Identity from a uuid alone.
    #[must_use]
    pub fn from_uuid(uuid: &str) -> Self {
        Self::new(Some(uuid), &[])
    }

    /// Identity from MACs alone.
    #[must_use]
    pub fn from_macs(mac_ids: &[&str]) -> Self {
        Self::new(None, mac_ids)
    }

    /// Parse the legacy `_`-joined hardware id string.
    #[must_use]
    pub fn from_joined(hw_id: &str) -> Self {
        let macs: Vec<&str> = hw_id.split('_').collect();
        Self::from_macs(&macs)
    }

    /// True when neither a uuid nor any MAC was supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uuid.is_none() && self.mac_ids.is_empty()
    }

    /// Hardware ids a node registered with this identity should own.
    #[must_use]
    pub fn hw_ids(&self) -> Vec<String> {
        match &self.uuid {
            Some(uuid) => vec![uuid.clone()],
            None => self.mac_ids.clone(),
        }
    }

    /// Key used for an unrecognized node: the uuid, else the MACs joined.
    #[must_use]
    pub fn boot_key(&self) -> Option<String> {
        match &self.uuid {
            Some(uuid) => Some(uuid.clone()),
            None if !self.mac_ids.is_empty() => Some(self.mac_ids.join("_")),
            None => None,
        }
    }
}

fn normalize_id(id: &str) -> Option<String> {
    let id = id.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_uppercase())
    }
}
