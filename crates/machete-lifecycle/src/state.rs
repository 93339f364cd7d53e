use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Fetched,
    Validated,
    Built,
    Running,
    Stopped,
    Removed,
    Failed,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 8] = [
        LifecycleState::Pending,
        LifecycleState::Fetched,
        LifecycleState::Validated,
        LifecycleState::Built,
        LifecycleState::Running,
        LifecycleState::Stopped,
        LifecycleState::Removed,
        LifecycleState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Fetched => "fetched",
            LifecycleState::Validated => "validated",
            LifecycleState::Built => "built",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Removed => "removed",
            LifecycleState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|state| state.as_str() == value)
    }

    /// Legal edges of the lifecycle graph. Staying in place is always allowed.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        if self == next || next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Fetched)
                | (Fetched, Validated)
                | (Validated, Built)
                | (Built, Running)
                | (Built, Stopped)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Stopped, Built)
                | (Built, Removed)
                | (Stopped, Removed)
                | (Validated, Removed)
                | (Failed, Removed)
                | (Pending, Removed)
                | (Fetched, Removed)
                | (Failed, Pending)
                | (Removed, Pending)
        )
    }

    /// A fresh install may replace a record in this state.
    pub fn allows_reinstall(self) -> bool {
        matches!(self, LifecycleState::Failed | LifecycleState::Removed)
    }

    /// The runtime may hold a container for a tool in this state.
    pub fn may_have_container(self) -> bool {
        matches!(
            self,
            LifecycleState::Built | LifecycleState::Running | LifecycleState::Stopped
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;
    use super::*;

    #[test]
    fn install_path_is_linear() {
        let path = [Pending, Fetched, Validated, Built, Running, Stopped, Removed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn skipping_steps_is_rejected() {
        assert!(!Pending.can_transition_to(Built));
        assert!(!Fetched.can_transition_to(Running));
        assert!(!Validated.can_transition_to(Running));
        assert!(!Removed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Removed));
    }

    #[test]
    fn every_state_can_fail() {
        for state in LifecycleState::ALL {
            assert!(state.can_transition_to(Failed));
        }
    }

    #[test]
    fn only_failed_and_removed_allow_reinstall() {
        let allowed: Vec<_> = LifecycleState::ALL
            .into_iter()
            .filter(|state| state.allows_reinstall())
            .collect();
        assert_eq!(allowed, vec![Removed, Failed]);
    }

    #[test]
    fn parse_round_trips_labels() {
        for state in LifecycleState::ALL {
            assert_eq!(LifecycleState::parse(state.as_str()), Some(state));
        }
        assert_eq!(LifecycleState::parse(" RUNNING "), Some(Running));
        assert_eq!(LifecycleState::parse("exploded"), None);
    }
}
