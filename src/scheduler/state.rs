//! Node state machine.

use serde::{Deserialize, Serialize};

/// State of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Waiting for dependencies.
    Pending,
    /// Dispatched in the current wave.
    Running,
    /// Produced an output.
    Done,
    /// Failed, timed out, or could not be scheduled.
    Errored,
}

impl NodeState {
    pub fn can_transition_to(&self, target: NodeState) -> bool {
        use NodeState::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Errored) | (Running, Done) | (Running, Errored)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Errored)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        use NodeState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Errored));
        assert!(Running.can_transition_to(Done));
        assert!(!Pending.can_transition_to(Done));
        assert!(!Done.can_transition_to(Running));
        assert!(!Errored.can_transition_to(Done));
    }

    #[test]
    fn terminal_states() {
        assert!(NodeState::Done.is_terminal());
        assert!(NodeState::Errored.is_terminal());
        assert!(!NodeState::Running.is_terminal());
        assert_eq!(NodeState::Errored.to_string(), "errored");
    }
}
