//! Engine configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::models::CommandName;
use crate::tags::TagRule;

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Cause.
        source: std::io::Error,
    },

    /// The file is not valid YAML for this structure.
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Cause.
        source: serde_yaml::Error,
    },

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Engine settings. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds without a checkin after which a node must re-register.
    pub register_timeout_secs: u64,

    /// Seconds without a checkin after which an unbound node is removed.
    pub node_expire_timeout_secs: u64,

    /// Seconds between expiry sweeps.
    pub expire_sweep_interval_secs: u64,

    /// API base URL embedded in boot scripts and callback URLs.
    pub server_url: String,

    /// Root directory of the JSON file store.
    pub persist_path: PathBuf,

    /// Per-node forced checkin command.
    pub checkin_overrides: BTreeMap<String, CommandName>,

    /// Tag rules evaluated for every node in addition to stored rules.
    pub system_tag_rules: Vec<TagRule>,

    /// Directory of `<name>.hbs` boot template overrides.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,

    /// Extra kernel arguments for the microkernel.
    pub microkernel_kernel_args: String,
}

const fn default_register_timeout() -> u64 {
    120
}

const fn default_node_expire_timeout() -> u64 {
    300
}

const fn default_sweep_interval() -> u64 {
    30
}

fn default_server_url() -> String {
    "http://127.0.0.1:8026/provision/api/v1".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            register_timeout_secs: default_register_timeout(),
            node_expire_timeout_secs: default_node_expire_timeout(),
            expire_sweep_interval_secs: default_sweep_interval(),
            server_url: default_server_url(),
            persist_path: PathBuf::from("./data"),
            checkin_overrides: BTreeMap::new(),
            system_tag_rules: Vec::new(),
            template_dir: None,
            microkernel_kernel_args: String::new(),
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file. A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, does not parse, or
    /// fails [`EngineConfig::validate`].
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match fs::read_to_string(path).await {
            Ok(contents) => Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML. An empty document yields the defaults.
    ///
    /// # Errors
    /// Returns an error if the YAML does not match this structure.
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for a zero register timeout or
    /// sweep interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.register_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "register_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.expire_sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "expire_sweep_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Register timeout as a duration.
    #[must_use]
    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }

    /// Node expiry threshold as a duration.
    #[must_use]
    pub fn node_expire_timeout(&self) -> Duration {
        Duration::from_secs(self.node_expire_timeout_secs)
    }

    /// Sweep interval as a duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expire_sweep_interval_secs)
    }
}
