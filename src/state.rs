//! Protocol state machine: states, transitions, and the
//! entry/exit actions each transition runs.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolState {
    Disconnected,
    DisconnectedWithError,
    Connecting,
    Connected,
    Processing,
    Pausing,
    Paused,
    Resuming,
    Cancelling,
    Finishing,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::DisconnectedWithError => "DISCONNECTED_WITH_ERROR",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Processing => "PROCESSING",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Resuming => "RESUMING",
            Self::Cancelling => "CANCELLING",
            Self::Finishing => "FINISHING",
        };
        write!(f, "{s}")
    }
}

impl ProtocolState {
    /// States in which the dispatcher treats a received `ok` as operational
    /// and grants send credit for it.
    pub fn is_operational(self) -> bool {
        matches!(self, Self::Processing | Self::Connected | Self::Paused)
    }

    /// States considered "busy" for the purpose of resend error handling
    /// (`resend(N)`: "if busy, cancel with error").
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Processing | Self::Pausing | Self::Cancelling | Self::Finishing)
    }

    pub fn is_connected_or_better(self) -> bool {
        !matches!(self, Self::Disconnected | Self::DisconnectedWithError | Self::Connecting)
    }
}

/// A requested transition, used so the caller can log `old -> new` and run
/// entry actions uniformly.
#[derive(Clone, Copy, Debug)]
pub struct Transition {
    pub from: ProtocolState,
    pub to: ProtocolState,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Validates that `to` is a legal transition from `from` 
/// Terminal/error transitions (`-> Disconnected*`) are always legal, since
/// any state can be torn down.
pub fn is_valid_transition(from: ProtocolState, to: ProtocolState) -> bool {
    use ProtocolState::*;

    if matches!(to, Disconnected | DisconnectedWithError) {
        return true;
    }

    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connected, Processing)
            | (Processing, Pausing)
            | (Processing, Paused)
            | (Pausing, Paused)
            | (Paused, Resuming)
            | (Resuming, Processing)
            | (Processing, Cancelling)
            | (Paused, Cancelling)
            | (Cancelling, Connected)
            | (Processing, Finishing)
            | (Paused, Finishing)
            | (Finishing, Connected)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProtocolState::*;

    #[test]
    fn connect_sequence_is_valid() {
        assert!(is_valid_transition(Disconnected, Connecting));
        assert!(is_valid_transition(Connecting, Connected));
        assert!(is_valid_transition(Connected, Processing));
    }

    #[test]
    fn any_state_can_disconnect_with_error() {
        assert!(is_valid_transition(Processing, DisconnectedWithError));
        assert!(is_valid_transition(Paused, DisconnectedWithError));
    }

    #[test]
    fn skipping_states_is_invalid() {
        assert!(!is_valid_transition(Disconnected, Processing));
        assert!(!is_valid_transition(Connected, Paused));
    }

    #[test]
    fn cancel_is_valid_from_paused_as_well_as_processing() {
        assert!(is_valid_transition(Processing, Cancelling));
        assert!(is_valid_transition(Paused, Cancelling));
    }

    #[test]
    fn operational_states_allow_ok_credit() {
        assert!(Processing.is_operational());
        assert!(Connected.is_operational());
        assert!(Paused.is_operational());
        assert!(!Connecting.is_operational());
    }
}
