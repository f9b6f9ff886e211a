//! `boot_local` and `discover_only`.

use std::sync::OnceLock;

use crate::boot::ArtifactKind;
use crate::error::EngineResult;
use crate::fsm::{Action, Machine, State, TransitionTable};
use crate::models::Command;

use super::{unknown_namespace, CallbackReply, TemplateDriver};

/// Driver for templates that never provision anything.
#[derive(Debug, Clone, Copy)]
pub struct NoOpDriver {
    boot: ArtifactKind,
}

impl NoOpDriver {
    /// Always boot the local disk.
    pub const BOOT_LOCAL: Self = Self {
        boot: ArtifactKind::LocalBoot,
    };

    /// Always boot the microkernel.
    pub const DISCOVER_ONLY: Self = Self {
        boot: ArtifactKind::Microkernel,
    };
}

fn table() -> &'static TransitionTable {
    static TABLE: OnceLock<TransitionTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        TransitionTable::builder()
            .state(
                State::Init,
                &[
                    (Action::Checkin, State::Init),
                    (Action::BootRequest, State::Init),
                ],
                Some(State::Init),
            )
            .build()
    })
}

impl TemplateDriver for NoOpDriver {
    fn transitions(&self) -> &'static TransitionTable {
        table()
    }

    fn on_checkin(&self, machine: &mut Machine) -> Command {
        machine.fire(table(), Action::Checkin, "checkin");
        Command::acknowledge()
    }

    fn on_boot_request(&self, machine: &mut Machine) -> ArtifactKind {
        let artifact = match machine.state {
            State::TimeoutError | State::ErrorCatch => ArtifactKind::Microkernel,
            _ => self.boot,
        };
        machine.fire(table(), Action::BootRequest, "boot");
        artifact
    }

    fn callback_namespaces(&self) -> &'static [&'static str] {
        &[]
    }

    fn on_callback(
        &self,
        _machine: &mut Machine,
        namespace: &str,
        _args: &[String],
    ) -> EngineResult<CallbackReply> {
        Err(unknown_namespace(namespace))
    }
}
