//! Commands returned to a checking-in agent.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What the booted agent should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    /// Send a full registration (facts included).
    Register,
    /// Nothing to do; keep checking in.
    Acknowledge,
    /// Reboot so the next boot picks up the bound model.
    Reboot,
    /// Power off.
    Poweroff,
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register => write!(f, "register"),
            Self::Acknowledge => write!(f, "acknowledge"),
            Self::Reboot => write!(f, "reboot"),
            Self::Poweroff => write!(f, "poweroff"),
        }
    }
}

impl FromStr for CommandName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "register" => Ok(Self::Register),
            "acknowledge" => Ok(Self::Acknowledge),
            "reboot" => Ok(Self::Reboot),
            "poweroff" => Ok(Self::Poweroff),
            _ => Err(format!(
                "Unknown command: {s}. Supported: register, acknowledge, reboot, poweroff"
            )),
        }
    }
}

/// Checkin response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command to run.
    pub command_name: CommandName,
    /// Command parameters.
    #[serde(default)]
    pub command_param: Map<String, Value>,
}

impl Command {
    /// A command without parameters.
    #[must_use]
    pub fn new(command_name: CommandName) -> Self {
        Self {
            command_name,
            command_param: Map::new(),
        }
    }

    /// `register`.
    #[must_use]
    pub fn register() -> Self {
        Self::new(CommandName::Register)
    }

    /// `acknowledge`.
    #[must_use]
    pub fn acknowledge() -> Self {
        Self::new(CommandName::Acknowledge)
    }

    /// `reboot`.
    #[must_use]
    pub fn reboot() -> Self {
        Self::new(CommandName::Reboot)
    }
}
