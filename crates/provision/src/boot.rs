//! Boot artifact rendering.
//!
//! Templates decide *which* artifact a node gets; this module turns that
//! choice into an iPXE script or config file using Handlebars templates.
//! Embedded defaults can be overridden per name from a directory of
//! `<name>.hbs` files.

use std::fmt;
use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;
use tracing::{debug, error};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{ActiveModel, Image, Node};
use crate::templates::TemplateKind;

/// Kinds of artifact the engine can hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// iPXE script booting the discovery microkernel.
    Microkernel,
    /// iPXE script chaining to the local disk.
    LocalBoot,
    /// iPXE script starting a network installer.
    InstallBoot,
    /// iPXE script booting an OS image into memory.
    InMemoryBoot,
    /// Cloud-config document for in-memory OSes.
    CloudConfig,
    /// Installer answer file (preseed or kickstart).
    AnswerFile,
    /// iPXE script that prints an error and reboots.
    ErrorScript,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Microkernel => "microkernel",
            Self::LocalBoot => "local_boot",
            Self::InstallBoot => "install_boot",
            Self::InMemoryBoot => "in_memory_boot",
            Self::CloudConfig => "cloud_config",
            Self::AnswerFile => "answer_file",
            Self::ErrorScript => "error_script",
        };
        f.write_str(name)
    }
}

/// A rendered artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootArtifact {
    /// What was rendered.
    pub kind: ArtifactKind,
    /// Rendered body.
    pub body: String,
}

/// Values available to every boot template.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootContext {
    /// Engine API base URL.
    pub server_url: String,
    /// Hardware-id key the microkernel reports back with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_id: Option<String>,
    /// Base URL of the image being booted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Kernel path within the image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    /// Initrd path within the image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,
    /// Extra kernel command line.
    pub kernel_args: String,
    /// Bound node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_uuid: Option<String>,
    /// Binding identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_model_uuid: Option<String>,
    /// Callback base URL for the binding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Assigned hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Assigned domain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domainname: Option<String>,
    /// Operator-supplied cloud-config body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_config: Option<String>,
    /// Error message for the error script.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BootContext {
    /// Context for the default microkernel boot.
    #[must_use]
    pub fn microkernel(config: &EngineConfig, image: &Image, hw_id: &str) -> Self {
        Self {
            server_url: config.server_url.clone(),
            hw_id: Some(hw_id.to_string()),
            image_url: Some(image_url(config, image)),
            kernel: Some(image.kernel.clone()),
            initrd: Some(image.initrd.clone()),
            kernel_args: config.microkernel_kernel_args.clone(),
            ..Self::default()
        }
    }

    /// Context for a bound node.
    #[must_use]
    pub fn binding(
        config: &EngineConfig,
        active: &ActiveModel,
        node: &Node,
        image: Option<&Image>,
    ) -> Self {
        Self {
            server_url: config.server_url.clone(),
            hw_id: Some(node.hw_id_key()),
            image_url: image.map(|i| image_url(config, i)),
            kernel: image.map(|i| i.kernel.clone()),
            initrd: image.map(|i| i.initrd.clone()),
            kernel_args: String::new(),
            node_uuid: Some(node.uuid.clone()),
            active_model_uuid: Some(active.uuid.clone()),
            callback_url: Some(format!(
                "{}/policy/callback/{}",
                config.server_url.trim_end_matches('/'),
                active.uuid
            )),
            hostname: Some(active.hostname()),
            domainname: Some(active.model.domainname.clone()),
            cloud_config: active.model.cloud_config.clone(),
            message: None,
        }
    }

    /// Context for the error script.
    #[must_use]
    pub fn error(config: &EngineConfig, message: impl Into<String>) -> Self {
        Self {
            server_url: config.server_url.clone(),
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

fn image_url(config: &EngineConfig, image: &Image) -> String {
    format!(
        "{}/image/{}",
        config.server_url.trim_end_matches('/'),
        image.uuid
    )
}

const TEMPLATE_NAMES: [&str; 8] = [
    "microkernel",
    "local_boot",
    "install_boot",
    "in_memory_boot",
    "cloud_config",
    "preseed",
    "kickstart",
    "error_script",
];

/// Manages Handlebars boot templates.
pub struct BootTemplates {
    handlebars: Handlebars<'static>,
}

impl fmt::Debug for BootTemplates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootTemplates").finish_non_exhaustive()
    }
}

impl BootTemplates {
    /// Create with the embedded templates.
    ///
    /// # Errors
    /// Returns [`EngineError::Render`] if an embedded template fails to parse.
    pub fn new() -> EngineResult<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);

        for (name, body) in TEMPLATE_NAMES.iter().zip(EMBEDDED) {
            handlebars
                .register_template_string(name, body)
                .map_err(|e| EngineError::Render(format!("template '{name}': {e}")))?;
        }

        Ok(Self { handlebars })
    }

    /// Create with the embedded templates, overridden by any
    /// `<name>.hbs` found in `dir`.
    ///
    /// # Errors
    /// Returns [`EngineError::Render`] if a file cannot be read or parsed.
    pub fn from_dir(dir: &Path) -> EngineResult<Self> {
        let mut templates = Self::new()?;

        for name in TEMPLATE_NAMES {
            let path = dir.join(format!("{name}.hbs"));
            if path.exists() {
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| EngineError::Render(format!("{}: {e}", path.display())))?;
                templates
                    .handlebars
                    .register_template_string(name, &content)
                    .map_err(|e| EngineError::Render(format!("{}: {e}", path.display())))?;
                debug!(template = name, path = %path.display(), "Loaded boot template override");
            }
        }

        Ok(templates)
    }

    /// Render one artifact.
    ///
    /// `template` picks the answer-file flavor and is ignored otherwise.
    ///
    /// # Errors
    /// Returns [`EngineError::Render`] if rendering fails.
    pub fn render(
        &self,
        kind: ArtifactKind,
        template: Option<TemplateKind>,
        ctx: &BootContext,
    ) -> EngineResult<BootArtifact> {
        let name = match kind {
            ArtifactKind::AnswerFile => template
                .and_then(TemplateKind::answer_file_namespace)
                .ok_or_else(|| EngineError::Render("template has no answer file".into()))?,
            ArtifactKind::Microkernel => "microkernel",
            ArtifactKind::LocalBoot => "local_boot",
            ArtifactKind::InstallBoot => "install_boot",
            ArtifactKind::InMemoryBoot => "in_memory_boot",
            ArtifactKind::CloudConfig => "cloud_config",
            ArtifactKind::ErrorScript => "error_script",
        };
        let body = self
            .handlebars
            .render(name, ctx)
            .map_err(|e| EngineError::Render(format!("template '{name}': {e}")))?;
        Ok(BootArtifact { kind, body })
    }

    /// Render the error script. Never fails: a broken override falls back
    /// to a fixed script.
    #[must_use]
    pub fn error_script(&self, config: &EngineConfig, message: &str) -> BootArtifact {
        let ctx = BootContext::error(config, message);
        self.render(ArtifactKind::ErrorScript, None, &ctx)
            .unwrap_or_else(|e| {
                error!(error = %e, "Error script template failed");
                BootArtifact {
                    kind: ArtifactKind::ErrorScript,
                    body: format!("#!ipxe\necho {message}\nsleep 15\nreboot\n"),
                }
            })
    }
}

const EMBEDDED: [&str; 8] = [
    MICROKERNEL_TEMPLATE,
    LOCAL_BOOT_TEMPLATE,
    INSTALL_BOOT_TEMPLATE,
    IN_MEMORY_BOOT_TEMPLATE,
    CLOUD_CONFIG_TEMPLATE,
    PRESEED_TEMPLATE,
    KICKSTART_TEMPLATE,
    ERROR_SCRIPT_TEMPLATE,
];

const MICROKERNEL_TEMPLATE: &str = r"#!ipxe
echo Booting microkernel for {{hw_id}}
kernel {{image_url}}/{{kernel}} maxcpus=1 hw_id={{hw_id}} server={{server_url}} {{kernel_args}} || goto error
initrd {{image_url}}/{{initrd}} || goto error
boot || goto error

:error
echo ERROR, will reboot in 15
sleep 15
reboot
";

const LOCAL_BOOT_TEMPLATE: &str = r"#!ipxe
echo Booting from local disk
sleep 3
sanboot --no-describe --drive 0x80 || exit
";

const INSTALL_BOOT_TEMPLATE: &str = r"#!ipxe
echo Installing {{hostname}}.{{domainname}}
kernel {{image_url}}/{{kernel}} auto=true url={{callback_url}}/answer/file hostname={{hostname}} domain={{domainname}} || goto error
initrd {{image_url}}/{{initrd}} || goto error
imgfetch {{callback_url}}/answer/start || goto error
boot || goto error

:error
echo ERROR, will reboot in 15
sleep 15
reboot
";

const IN_MEMORY_BOOT_TEMPLATE: &str = r"#!ipxe
echo Booting {{hostname}} into memory
kernel {{image_url}}/{{kernel}} cloud-config-url={{callback_url}}/cloud-config hostname={{hostname}} {{kernel_args}} || goto error
initrd {{image_url}}/{{initrd}} || goto error
boot || goto error

:error
echo ERROR, will reboot in 15
sleep 15
reboot
";

const CLOUD_CONFIG_TEMPLATE: &str = r"#cloud-config
hostname: {{hostname}}
{{#if cloud_config}}
{{cloud_config}}
{{/if}}
write_files:
  - path: /etc/provision/callback
    content: |
      curl {{callback_url}}/postinstall/complete || curl {{callback_url}}/postinstall/install_fail
";

const PRESEED_TEMPLATE: &str = r"d-i debian-installer/locale string en_US
d-i netcfg/get_hostname string {{hostname}}
d-i netcfg/get_domain string {{domainname}}
d-i preseed/early_command string wget -q -O /dev/null {{callback_url}}/preseed/start
d-i preseed/late_command string wget -q -O /dev/null {{callback_url}}/preseed/end; in-target sh -c 'curl {{callback_url}}/postinstall/complete || curl {{callback_url}}/postinstall/install_fail'
d-i finish-install/reboot_in_progress note
";

const KICKSTART_TEMPLATE: &str = r"install
network --bootproto=dhcp --hostname={{hostname}}.{{domainname}}
reboot
%pre
curl {{callback_url}}/kickstart/start
%end
%post
curl {{callback_url}}/kickstart/end
curl {{callback_url}}/postinstall/complete || curl {{callback_url}}/postinstall/install_fail
%end
";

const ERROR_SCRIPT_TEMPLATE: &str = r"#!ipxe
echo {{message}}
echo will reboot in 15
sleep 15
reboot
";
