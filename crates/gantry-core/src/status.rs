//! Lifecycle status shared by builds, steps, and services.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Status of a build, step, or service record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Planned but not yet started.
    #[default]
    #[display("pending")]
    Pending,
    /// Container is executing.
    #[display("running")]
    Running,
    /// Exited zero.
    #[display("success")]
    Success,
    /// Exited non-zero.
    #[display("failure")]
    Failure,
    /// Terminated by cancellation.
    #[display("killed")]
    Killed,
    /// Ruleset evaluated false; never executed.
    #[display("skipped")]
    Skipped,
    /// The worker itself failed while driving the unit.
    #[display("error")]
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Killed | Status::Skipped | Status::Error
        )
    }

    /// Severity ordering used to aggregate step outcomes into a build
    /// outcome. `Failure > Success`; skipped units carry no weight.
    pub fn severity(self) -> u8 {
        match self {
            Status::Skipped => 0,
            Status::Pending => 1,
            Status::Running => 2,
            Status::Success => 3,
            Status::Failure => 4,
            Status::Killed => 5,
            Status::Error => 6,
        }
    }

    /// The more severe of two statuses.
    pub fn worst(self, other: Status) -> Status {
        if other.severity() > self.severity() { other } else { self }
    }

    /// Whether the state machine permits moving from `self` to `to`.
    ///
    /// Pending may start running, be skipped, or jump straight to a
    /// terminal outcome when the unit never starts. Running may only
    /// terminate. Terminal states never transition.
    pub fn can_transition(self, to: Status) -> bool {
        match self {
            Status::Pending => matches!(
                to,
                Status::Running
                    | Status::Skipped
                    | Status::Failure
                    | Status::Killed
                    | Status::Error
            ),
            Status::Running => matches!(
                to,
                Status::Success | Status::Failure | Status::Killed | Status::Error
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(Status::Success.is_terminal());
        assert!(Status::Failure.is_terminal());
        assert!(Status::Killed.is_terminal());
        assert!(Status::Skipped.is_terminal());
    }

    #[test]
    fn failure_outweighs_success() {
        assert_eq!(Status::Success.worst(Status::Failure), Status::Failure);
        assert_eq!(Status::Failure.worst(Status::Success), Status::Failure);
        assert_eq!(Status::Running.worst(Status::Killed), Status::Killed);
    }

    #[test]
    fn skipped_is_only_reachable_from_pending() {
        assert!(Status::Pending.can_transition(Status::Skipped));
        assert!(!Status::Running.can_transition(Status::Skipped));
        assert!(!Status::Success.can_transition(Status::Skipped));
    }

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [Status::Success, Status::Failure, Status::Killed, Status::Skipped] {
            for to in [Status::Pending, Status::Running, Status::Success, Status::Failure] {
                assert!(!terminal.can_transition(to));
            }
        }
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Running).unwrap(), "\"running\"");
        assert_eq!(Status::Killed.to_string(), "killed");
    }
}
