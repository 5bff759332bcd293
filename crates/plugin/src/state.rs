//! Plugin process state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states of one plugin subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Spawned, handshake not yet completed.
    Starting,
    /// Handshake done, no request in flight.
    Ready,
    /// A request is in flight.
    Busy,
    /// Idle after at least one request.
    Idle,
    /// Shutdown requested, draining.
    ShuttingDown,
    /// The process has exited or was killed.
    Dead,
}

impl ProcessState {
    /// Whether this state permits a transition to `target`.
    #[must_use]
    pub fn can_transition_to(self, target: ProcessState) -> bool {
        use ProcessState::{Busy, Dead, Idle, Ready, ShuttingDown, Starting};
        matches!(
            (self, target),
            (Starting, Ready | Dead)
                | (Ready, Busy | ShuttingDown | Dead)
                | (Busy, Idle | ShuttingDown | Dead)
                | (Idle, Busy | ShuttingDown | Dead)
                | (ShuttingDown, Dead)
        )
    }

    /// Whether the process can accept a new request.
    #[must_use]
    pub fn accepts_requests(self) -> bool {
        matches!(self, Self::Ready | Self::Idle)
    }

    /// Whether the process is gone.
    #[must_use]
    pub fn is_dead(self) -> bool {
        self == Self::Dead
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Idle => "idle",
            Self::ShuttingDown => "shutting_down",
            Self::Dead => "dead",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ProcessState::Starting, ProcessState::Ready, true)]
    #[case(ProcessState::Starting, ProcessState::Busy, false)]
    #[case(ProcessState::Ready, ProcessState::Busy, true)]
    #[case(ProcessState::Busy, ProcessState::Idle, true)]
    #[case(ProcessState::Idle, ProcessState::Busy, true)]
    #[case(ProcessState::Busy, ProcessState::Ready, false)]
    #[case(ProcessState::ShuttingDown, ProcessState::Dead, true)]
    #[case(ProcessState::ShuttingDown, ProcessState::Busy, false)]
    #[case(ProcessState::Dead, ProcessState::Ready, false)]
    fn transitions(
        #[case] from: ProcessState,
        #[case] to: ProcessState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn every_live_state_may_die() {
        for state in [
            ProcessState::Starting,
            ProcessState::Ready,
            ProcessState::Busy,
            ProcessState::Idle,
            ProcessState::ShuttingDown,
        ] {
            assert!(state.can_transition_to(ProcessState::Dead));
        }
    }

    #[test]
    fn request_acceptance() {
        assert!(ProcessState::Ready.accepts_requests());
        assert!(ProcessState::Idle.accepts_requests());
        assert!(!ProcessState::Busy.accepts_requests());
        assert!(!ProcessState::Starting.accepts_requests());
        assert!(!ProcessState::Dead.accepts_requests());
    }

    #[test]
    fn display_matches_serde() {
        let json = serde_json::to_string(&ProcessState::ShuttingDown).unwrap();
        assert_eq!(json, r#""shutting_down""#);
        assert_eq!(ProcessState::ShuttingDown.to_string(), "shutting_down");
    }
}
