//! Templates that install an OS to disk through a network installer.

use std::sync::OnceLock;

use tracing::info;

use crate::boot::ArtifactKind;
use crate::error::EngineResult;
use crate::fsm::{Action, Machine, State, TransitionTable};
use crate::models::Command;

use super::{unknown_argument, unknown_namespace, CallbackReply, TemplateDriver};

/// Driver for network-install templates.
///
/// The installer fetches its answer file from the `preseed` or `kickstart`
/// namespace, then reports through `postinstall` once the OS is on disk.
#[derive(Debug, Clone, Copy)]
pub struct InstallDriver {
    answer_namespace: &'static str,
    namespaces: &'static [&'static str],
}

impl InstallDriver {
    /// Debian-style installers.
    pub const PRESEED: Self = Self {
        answer_namespace: "preseed",
        namespaces: &["preseed", "postinstall"],
    };

    /// Anaconda and ESXi installers.
    pub const KICKSTART: Self = Self {
        answer_namespace: "kickstart",
        namespaces: &["kickstart", "postinstall"],
    };

    fn answer_file(
        machine: &mut Machine,
        namespace: &str,
        args: &[String],
    ) -> EngineResult<CallbackReply> {
        let method = format!("callback:{namespace}");
        match args.first().map(String::as_str) {
            Some("start") => {
                machine.fire(table(), Action::InstallStart, &method);
                Ok(CallbackReply::Ok)
            }
            Some("file") => {
                machine.fire(table(), Action::InstallFile, &method);
                Ok(CallbackReply::Artifact(ArtifactKind::AnswerFile))
            }
            Some("end") => {
                machine.fire(table(), Action::InstallEnd, &method);
                Ok(CallbackReply::Ok)
            }
            _ => Err(unknown_argument(namespace, args)),
        }
    }

    fn postinstall(machine: &mut Machine, args: &[String]) -> EngineResult<CallbackReply> {
        const METHOD: &str = "callback:postinstall";
        match args.first().map(String::as_str) {
            Some("complete") => {
                machine.fire(table(), Action::InstallComplete, METHOD);
                Ok(CallbackReply::Ok)
            }
            Some("install_fail") => {
                machine.fire(table(), Action::InstallFail, METHOD);
                Ok(CallbackReply::Ok)
            }
            Some("end") => {
                machine.fire(table(), Action::InstallComplete, METHOD);
                Ok(CallbackReply::Ok)
            }
            Some("send_ips") => match args.get(1) {
                Some(ip) if !ip.trim().is_empty() => {
                    info!(ip = %ip, "Installed node reported address");
                    Ok(CallbackReply::RecordIp(ip.trim().to_string()))
                }
                _ => Err(unknown_argument("postinstall", &args[1..])),
            },
            _ => Err(unknown_argument("postinstall", args)),
        }
    }
}

fn table() -> &'static TransitionTable {
    static TABLE: OnceLock<TransitionTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        TransitionTable::builder()
            .state(
                State::Init,
                &[
                    (Action::Checkin, State::Init),
                    (Action::BootRequest, State::Preinstall),
                    (Action::InstallStart, State::Preinstall),
                    (Action::InstallFile, State::Preinstall),
                ],
                Some(State::Init),
            )
            .state(
                State::Preinstall,
                &[
                    (Action::Checkin, State::Preinstall),
                    (Action::BootRequest, State::Preinstall),
                    (Action::InstallStart, State::Preinstall),
                    (Action::InstallFile, State::Preinstall),
                    (Action::InstallEnd, State::Postinstall),
                ],
                Some(State::Preinstall),
            )
            .state(
                State::Postinstall,
                &[
                    (Action::Checkin, State::Postinstall),
                    (Action::BootRequest, State::Postinstall),
                    (Action::InstallComplete, State::OsComplete),
                    (Action::InstallFail, State::ErrorCatch),
                ],
                Some(State::Postinstall),
            )
            .state(
                State::OsComplete,
                &[
                    (Action::Checkin, State::OsComplete),
                    (Action::BootRequest, State::OsComplete),
                ],
                Some(State::OsComplete),
            )
            .terminal(&[State::OsComplete])
            .build()
    })
}

impl TemplateDriver for InstallDriver {
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
            State::Init | State::Preinstall => ArtifactKind::InstallBoot,
            State::Postinstall | State::OsComplete => ArtifactKind::LocalBoot,
            State::TimeoutError | State::ErrorCatch => ArtifactKind::Microkernel,
        };
        machine.fire(table(), Action::BootRequest, "boot");
        artifact
    }

    fn callback_namespaces(&self) -> &'static [&'static str] {
        self.namespaces
    }

    fn on_callback(
        &self,
        machine: &mut Machine,
        namespace: &str,
        args: &[String],
    ) -> EngineResult<CallbackReply> {
        if namespace == self.answer_namespace {
            Self::answer_file(machine, namespace, args)
        } else if namespace == "postinstall" {
            Self::postinstall(machine, args)
        } else {
            Err(unknown_namespace(namespace))
        }
    }
}
