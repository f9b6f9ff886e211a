//! Model templates.
//!
//! A template is one variant of a closed set. Each variant owns a
//! transition table and decides, per state, which command a checking-in
//! agent gets and which boot artifact a booting node gets. Turning that
//! decision into bytes is the job of [`crate::boot::BootTemplates`].

mod in_memory;
mod install;
mod noop;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::boot::ArtifactKind;
use crate::error::{EngineError, EngineResult};
use crate::fsm::{Machine, TransitionTable};
use crate::models::Command;
use crate::store::{Document, Kind};

pub use in_memory::InMemoryDriver;
pub use install::InstallDriver;
pub use noop::NoOpDriver;

/// Available model templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Boot from the local disk; never installs anything.
    BootLocal,
    /// Keep the node in the microkernel for inventory only.
    DiscoverOnly,
    /// CoreOS booted into memory.
    CoreosInMemory,
    /// RancherOS booted into memory.
    RancherosInMemory,
    /// Ubuntu 16.04 network install.
    UbuntuXenial,
    /// CentOS 7 network install.
    Centos7,
    /// VMware ESXi 5 install.
    VmwareEsxi5,
}

/// Template families sharing one driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// No provisioning; usable for the default policy.
    NoOp,
    /// Boots an OS image into memory on every boot.
    InMemory,
    /// Installs an OS to disk.
    Install,
}

impl TemplateKind {
    /// Every template.
    pub const ALL: [Self; 7] = [
        Self::BootLocal,
        Self::DiscoverOnly,
        Self::CoreosInMemory,
        Self::RancherosInMemory,
        Self::UbuntuXenial,
        Self::Centos7,
        Self::VmwareEsxi5,
    ];

    /// Family of this template.
    #[must_use]
    pub fn family(self) -> Family {
        match self {
            Self::BootLocal | Self::DiscoverOnly => Family::NoOp,
            Self::CoreosInMemory | Self::RancherosInMemory => Family::InMemory,
            Self::UbuntuXenial | Self::Centos7 | Self::VmwareEsxi5 => Family::Install,
        }
    }

    /// No-op templates are the only ones allowed on a default policy.
    #[must_use]
    pub fn is_no_op(self) -> bool {
        self.family() == Family::NoOp
    }

    /// In-memory templates are the only ones a rebind request can use.
    #[must_use]
    pub fn is_in_memory(self) -> bool {
        self.family() == Family::InMemory
    }

    /// Name of the installer answer-file callback namespace.
    #[must_use]
    pub fn answer_file_namespace(self) -> Option<&'static str> {
        match self {
            Self::UbuntuXenial => Some("preseed"),
            Self::Centos7 | Self::VmwareEsxi5 => Some("kickstart"),
            _ => None,
        }
    }

    /// Driver implementing this template's behavior.
    #[must_use]
    pub fn driver(self) -> &'static dyn TemplateDriver {
        match self {
            Self::BootLocal => &NoOpDriver::BOOT_LOCAL,
            Self::DiscoverOnly => &NoOpDriver::DISCOVER_ONLY,
            Self::CoreosInMemory | Self::RancherosInMemory => &InMemoryDriver,
            Self::UbuntuXenial => &InstallDriver::PRESEED,
            Self::Centos7 | Self::VmwareEsxi5 => &InstallDriver::KICKSTART,
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BootLocal => "boot_local",
            Self::DiscoverOnly => "discover_only",
            Self::CoreosInMemory => "coreos_in_memory",
            Self::RancherosInMemory => "rancheros_in_memory",
            Self::UbuntuXenial => "ubuntu_xenial",
            Self::Centos7 => "centos7",
            Self::VmwareEsxi5 => "vmware_esxi5",
        };
        f.write_str(name)
    }
}

impl FromStr for TemplateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.to_string() == wanted)
            .ok_or_else(|| {
                let known: Vec<String> = Self::ALL.iter().map(ToString::to_string).collect();
                format!("Unknown template: {s}. Supported: {}", known.join(", "))
            })
    }
}

/// What a callback handler asks the caller to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackReply {
    /// Plain acknowledgement.
    Ok,
    /// Render this artifact for the bound node.
    Artifact(ArtifactKind),
    /// Record the node's reported IP address, then acknowledge.
    RecordIp(String),
}

/// Shared FSM-driving interface implemented by every template family.
pub trait TemplateDriver: Send + Sync {
    /// Transition table for this family.
    fn transitions(&self) -> &'static TransitionTable;

    /// Handle a checkin from the bound agent.
    fn on_checkin(&self, machine: &mut Machine) -> Command;

    /// Handle a boot request; returns the artifact to render.
    fn on_boot_request(&self, machine: &mut Machine) -> ArtifactKind;

    /// Callback namespaces this family answers.
    fn callback_namespaces(&self) -> &'static [&'static str];

    /// Handle an out-of-band progress report.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown namespace and
    /// [`EngineError::Input`] for an unknown argument.
    fn on_callback(
        &self,
        machine: &mut Machine,
        namespace: &str,
        args: &[String],
    ) -> EngineResult<CallbackReply>;
}

pub(crate) fn unknown_namespace(namespace: &str) -> EngineError {
    EngineError::NotFound(format!("no callback registered for namespace '{namespace}'"))
}

pub(crate) fn unknown_argument(namespace: &str, args: &[String]) -> EngineError {
    EngineError::Input(format!(
        "unrecognized argument {:?} for callback '{namespace}'",
        args.first().map_or("", String::as_str)
    ))
}

/// A configured template instance that policies point at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Identifier.
    pub uuid: String,
    /// Human-readable label.
    pub label: String,
    /// Template variant.
    pub template: TemplateKind,
    /// Hostname prefix; the binding counter is appended.
    #[serde(default)]
    pub hostname_prefix: String,
    /// Domain name written into the OS.
    #[serde(default = "default_domain")]
    pub domainname: String,
    /// OS image to install or boot.
    #[serde(default)]
    pub image_id: Option<String>,
    /// Cloud-config body for in-memory templates.
    #[serde(default)]
    pub cloud_config: Option<String>,
    /// Store version.
    #[serde(default)]
    pub version: u64,
}

fn default_domain() -> String {
    "localdomain".to_string()
}

impl Model {
    /// A new model of `template`.
    #[must_use]
    pub fn new(label: impl Into<String>, template: TemplateKind) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            label: label.into(),
            template,
            hostname_prefix: "node".to_string(),
            domainname: default_domain(),
            image_id: None,
            cloud_config: None,
            version: 0,
        }
    }

    /// Attach an OS image.
    #[must_use]
    pub fn with_image(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    /// Hostname for the `counter`-th binding.
    #[must_use]
    pub fn hostname(&self, counter: u64) -> String {
        format!("{}{counter}", self.hostname_prefix)
    }

    /// Check the model is usable.
    ///
    /// # Errors
    /// Returns [`EngineError::Input`] when a provisioning template lacks an
    /// image or a usable hostname prefix.
    pub fn validate(&self) -> EngineResult<()> {
        if self.template.is_no_op() {
            return Ok(());
        }
        if self.image_id.as_deref().is_none_or(str::is_empty) {
            return Err(EngineError::Input(format!(
                "model '{}' ({}) requires an image",
                self.label, self.template
            )));
        }
        let prefix_ok = self
            .hostname_prefix
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
            && self
                .hostname_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !prefix_ok {
            return Err(EngineError::Input(format!(
                "invalid hostname prefix '{}'",
                self.hostname_prefix
            )));
        }
        Ok(())
    }
}

impl Document for Model {
    const KIND: Kind = Kind::Model;

    fn uuid(&self) -> &str {
        &self.uuid
    }
}
