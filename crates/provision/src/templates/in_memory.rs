//! Templates that boot an OS image straight into memory.

use std::sync::OnceLock;

use crate::boot::ArtifactKind;
use crate::error::EngineResult;
use crate::fsm::{Action, Machine, State, TransitionTable};
use crate::models::Command;

use super::{unknown_argument, unknown_namespace, CallbackReply, TemplateDriver};

/// Driver shared by the CoreOS and RancherOS in-memory templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryDriver;

const NAMESPACES: &[&str] = &["postinstall", "cloud-config"];

fn table() -> &'static TransitionTable {
    static TABLE: OnceLock<TransitionTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        TransitionTable::builder()
            .state(
                State::Init,
                &[
                    (Action::Checkin, State::Init),
                    (Action::BootRequest, State::Init),
                    (Action::InstallComplete, State::OsComplete),
                    (Action::InstallFail, State::ErrorCatch),
                ],
                Some(State::Init),
            )
            .state(
                State::OsComplete,
                &[
                    (Action::Checkin, State::OsComplete),
                    (Action::BootRequest, State::OsComplete),
                    (Action::InstallFail, State::ErrorCatch),
                ],
                Some(State::OsComplete),
            )
            .terminal(&[State::OsComplete])
            .build()
    })
}

impl TemplateDriver for InMemoryDriver {
    fn transitions(&self) -> &'static TransitionTable {
        table()
    }

    fn on_checkin(&self, machine: &mut Machine) -> Command {
        let command = match machine.state {
            State::Init | State::Preinstall => Command::reboot(),
            _ => Command::acknowledge(),
        };
        machine.fire(table(), Action::Checkin, "checkin");
        command
    }

    fn on_boot_request(&self, machine: &mut Machine) -> ArtifactKind {
        let artifact = match machine.state {
            State::Init | State::Postinstall | State::OsComplete => ArtifactKind::InMemoryBoot,
            _ => ArtifactKind::Microkernel,
        };
        machine.fire(table(), Action::BootRequest, "boot");
        artifact
    }

    fn callback_namespaces(&self) -> &'static [&'static str] {
        NAMESPACES
    }

    fn on_callback(
        &self,
        machine: &mut Machine,
        namespace: &str,
        args: &[String],
    ) -> EngineResult<CallbackReply> {
        match namespace {
            "cloud-config" => Ok(CallbackReply::Artifact(ArtifactKind::CloudConfig)),
            "postinstall" => {
                let action = match args.first().map(String::as_str) {
                    Some("complete") => Action::InstallComplete,
                    Some("install_fail") => Action::InstallFail,
                    _ => return Err(unknown_argument(namespace, args)),
                };
                machine.fire(table(), action, "callback:postinstall");
                Ok(CallbackReply::Ok)
            }
            _ => Err(unknown_namespace(namespace)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_checkin_in_init_reboots() {
        let mut machine = Machine::new();
        assert_eq!(InMemoryDriver.on_checkin(&mut machine), Command::reboot());
        assert_eq!(machine.state, State::Init);
    }

    #[test]
    fn test_complete_callback_reaches_terminal_state() {
        let mut machine = Machine::new();
        assert_eq!(InMemoryDriver.on_boot_request(&mut machine), ArtifactKind::InMemoryBoot);
        InMemoryDriver
            .on_callback(&mut machine, "postinstall", &args(&["complete"]))
            .unwrap();
        assert_eq!(machine.state, State::OsComplete);
        assert!(table().is_terminal(machine.state));
        assert_eq!(InMemoryDriver.on_checkin(&mut machine), Command::acknowledge());
        assert_eq!(InMemoryDriver.on_boot_request(&mut machine), ArtifactKind::InMemoryBoot);
    }

    #[test]
    fn test_install_fail_boots_microkernel() {
        let mut machine = Machine::new();
        InMemoryDriver
            .on_callback(&mut machine, "postinstall", &args(&["install_fail"]))
            .unwrap();
        assert_eq!(machine.state, State::ErrorCatch);
        assert_eq!(InMemoryDriver.on_boot_request(&mut machine), ArtifactKind::Microkernel);
    }

    #[test]
    fn test_cloud_config_callback_leaves_state() {
        let mut machine = Machine::new();
        let reply = InMemoryDriver
            .on_callback(&mut machine, "cloud-config", &[])
            .unwrap();
        assert_eq!(reply, CallbackReply::Artifact(ArtifactKind::CloudConfig));
        assert_eq!(machine.steps, 0);
    }

    #[test]
    fn test_unknown_callback_argument() {
        let mut machine = Machine::new();
        assert!(InMemoryDriver
            .on_callback(&mut machine, "postinstall", &args(&["bogus"]))
            .is_err());
        assert!(InMemoryDriver.on_callback(&mut machine, "preseed", &[]).is_err());
    }
}
