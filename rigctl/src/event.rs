//! Notifications delivered to the presentation layer.

use std::collections::BTreeSet;
use std::fmt;

use crate::protocol::{Role, SessionState, Stage, StageStatus};

/// Operator controls whose state the core drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    /// Run the test.
    Run,
    /// Flash the Target.
    Flash,
    /// Flash the Target, then run the test.
    FlashAndRun,
}

impl Control {
    /// All controls.
    pub const ALL: [Self; 3] = [Self::Run, Self::Flash, Self::FlashAndRun];
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Run => "run",
            Self::Flash => "flash",
            Self::FlashAndRun => "flash-run",
        })
    }
}

/// Visual state of a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlState {
    /// Default appearance.
    Idle,
    /// Operation in progress.
    Busy,
    /// Operation finished successfully.
    Success,
    /// Operation failed.
    Error,
}

/// Fault marker raised on a role's port selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Lines on this link do not carry the role's tag, or a send failed.
    WrongPort,
    /// Both roles are bound to the same device.
    CrossWiring,
}

/// One presentation-layer notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// A log line. `role: None` is an informational line meant for both panes.
    Log {
        /// Pane the line belongs to.
        role: Option<Role>,
        /// Line text.
        text: String,
    },
    /// Clear both log panes.
    ClearLogs,
    /// A stage indicator changed.
    Stage {
        /// Stage concerned.
        stage: Stage,
        /// New status.
        status: StageStatus,
    },
    /// A role's ready indicator changed.
    Ready {
        /// Role concerned.
        role: Role,
        /// Whether the role has produced a well-formed line since binding.
        ready: bool,
    },
    /// Session state or problem pins changed.
    Session {
        /// Overall state.
        state: SessionState,
        /// Pins implicated in stage errors so far.
        problem_pins: BTreeSet<String>,
    },
    /// A control changed state.
    Control {
        /// Control concerned.
        control: Control,
        /// New state.
        state: ControlState,
    },
    /// Fault marker on a role's selector.
    Fault {
        /// Role concerned.
        role: Role,
        /// Fault kind.
        kind: FaultKind,
    },
    /// A link opened or lost its device.
    Link {
        /// Role concerned.
        role: Role,
        /// Device identifier.
        device: String,
        /// Whether the connection is now open.
        connected: bool,
    },
}

impl UiEvent {
    /// Informational log line for both panes.
    pub fn info(text: impl Into<String>) -> Self {
        Self::Log {
            role: None,
            text: text.into(),
        }
    }

    /// Control state change.
    pub fn control(control: Control, state: ControlState) -> Self {
        Self::Control { control, state }
    }
}
