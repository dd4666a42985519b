//! Orchestration states and the transition rules between them.

use std::fmt;

use thiserror::Error;

/// Phase of a single update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpdateState {
    #[default]
    Idle,
    CheckingVersion,
    Downloading,
    /// Bootloader-entry command sent over the application channel.
    EnteringDfu,
    /// Operator placed the device in bootloader mode by hand.
    WaitingDfu,
    ConnectingDfu,
    Flashing,
    Rebooting,
    Complete,
    Error,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateState::Idle => "IDLE",
            UpdateState::CheckingVersion => "CHECKING_VERSION",
            UpdateState::Downloading => "DOWNLOADING",
            UpdateState::EnteringDfu => "ENTERING_DFU",
            UpdateState::WaitingDfu => "WAITING_DFU",
            UpdateState::ConnectingDfu => "CONNECTING_DFU",
            UpdateState::Flashing => "FLASHING",
            UpdateState::Rebooting => "REBOOTING",
            UpdateState::Complete => "COMPLETE",
            UpdateState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateState::Complete | UpdateState::Error)
    }

    /// Whether moving from `self` to `to` is a legal step.
    pub fn can_transition_to(&self, to: UpdateState) -> bool {
        use UpdateState::*;

        if self.is_terminal() {
            return false;
        }
        match to {
            Idle => false,
            Error => true,
            CheckingVersion => *self == Idle,
            Downloading | EnteringDfu | WaitingDfu => {
                matches!(self, Idle | CheckingVersion | Downloading) && *self != to
            }
            ConnectingDfu => matches!(self, EnteringDfu | WaitingDfu),
            Flashing => *self == ConnectingDfu,
            Rebooting => *self == Flashing,
            Complete => *self == Rebooting,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: UpdateState,
    pub to: UpdateState,
}

/// Validate a step from `from` to `to`, returning the new state.
pub fn transition(from: UpdateState, to: UpdateState) -> Result<UpdateState, InvalidTransition> {
    if from.can_transition_to(to) {
        Ok(to)
    } else {
        Err(InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::UpdateState::*;
    use super::*;

    const ALL: [UpdateState; 10] = [
        Idle,
        CheckingVersion,
        Downloading,
        EnteringDfu,
        WaitingDfu,
        ConnectingDfu,
        Flashing,
        Rebooting,
        Complete,
        Error,
    ];

    #[test]
    fn test_automatic_path() {
        let path = [
            Idle,
            CheckingVersion,
            Downloading,
            EnteringDfu,
            ConnectingDfu,
            Flashing,
            Rebooting,
            Complete,
        ];
        for pair in path.windows(2) {
            assert_eq!(transition(pair[0], pair[1]), Ok(pair[1]));
        }
    }

    #[test]
    fn test_manual_local_path() {
        let path = [Idle, WaitingDfu, ConnectingDfu, Flashing, Rebooting, Complete];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_error_reachable_from_every_live_state() {
        for state in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(state.can_transition_to(Error), "{}", state);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for to in ALL {
            assert!(!Complete.can_transition_to(to));
            assert!(!Error.can_transition_to(to));
        }
    }

    #[test]
    fn test_no_backward_or_skipping_steps() {
        assert!(transition(Flashing, ConnectingDfu).is_err());
        assert!(transition(Idle, Flashing).is_err());
        assert!(transition(Downloading, ConnectingDfu).is_err());
        assert!(transition(Flashing, Complete).is_err());
        assert!(transition(ConnectingDfu, Idle).is_err());
        assert!(transition(EnteringDfu, WaitingDfu).is_err());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ConnectingDfu.to_string(), "CONNECTING_DFU");
        assert_eq!(CheckingVersion.to_string(), "CHECKING_VERSION");
    }
}
