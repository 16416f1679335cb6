//! Lifecycle states of a supervised program.
use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumString};

/// Lifecycle state of a [`super::ProcessSupervisor`].
///
/// `Idle -> Initializing -> Launching -> Running -> {WaitingToRestart -> Launching | CleaningUp -> Idle}`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// No monitoring thread and no child process.
    #[default]
    Idle,
    /// `start` accepted; the monitoring thread is validating configuration.
    Initializing,
    /// The operating system is being asked to create the child.
    Launching,
    /// The child is alive and being watched.
    Running,
    /// The child exited on its own; sleeping through the hold-off before relaunching.
    WaitingToRestart,
    /// `stop` is tearing the supervisor down.
    CleaningUp,
}

impl ProcessState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;

        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Launching)
                | (Initializing, Idle)
                | (Initializing, CleaningUp)
                | (Launching, Running)
                | (Launching, Idle)
                | (Launching, CleaningUp)
                | (Running, WaitingToRestart)
                | (Running, Idle)
                | (Running, CleaningUp)
                | (WaitingToRestart, Launching)
                | (WaitingToRestart, Idle)
                | (WaitingToRestart, CleaningUp)
                | (CleaningUp, Idle)
        )
    }

    /// True for every state in which a monitoring thread is expected to exist.
    pub fn is_active(self) -> bool {
        !matches!(self, ProcessState::Idle)
    }
}
