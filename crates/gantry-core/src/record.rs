//! Mutable per-execution records reported to the control plane.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::status::Status;

/// The build record: input metadata plus the worker-owned execution state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub number: i64,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub finished: i64,
    /// Summary error surfaced to the user on abnormal termination.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub distribution: String,
}

/// Execution state of one step, created at plan time and mutated only by
/// the executor coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub number: i64,
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub finished: i64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub distribution: String,
}

/// Execution state of one service container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub number: i64,
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub finished: i64,
}

impl StepRecord {
    /// Apply a status transition, honoring the state machine: illegal
    /// transitions (including any move out of a terminal state) are
    /// ignored so the first terminal outcome sticks.
    pub fn transition(&mut self, to: Status) -> bool {
        if !self.status.can_transition(to) {
            return false;
        }
        self.status = to;
        if to.is_terminal() && self.finished == 0 {
            self.finished = Utc::now().timestamp();
        }
        true
    }
}

impl ServiceRecord {
    pub fn transition(&mut self, to: Status) -> bool {
        if !self.status.can_transition(to) {
            return false;
        }
        self.status = to;
        if to.is_terminal() && self.finished == 0 {
            self.finished = Utc::now().timestamp();
        }
        true
    }
}

/// Append-only log buffer tied 1:1 to a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Owning step or service number.
    pub number: i64,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl LogRecord {
    /// Append bytes. The buffer is never truncated by the worker.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_transitions_follow_state_machine() {
        let mut step = StepRecord {
            number: 1,
            name: "build".to_string(),
            ..Default::default()
        };

        assert!(step.transition(Status::Running));
        assert!(!step.transition(Status::Pending));
        assert!(step.transition(Status::Failure));
        assert!(step.finished > 0);

        // Terminal outcome sticks.
        assert!(!step.transition(Status::Success));
        assert_eq!(step.status, Status::Failure);
    }

    #[test]
    fn skip_only_from_pending() {
        let mut step = StepRecord::default();
        assert!(step.transition(Status::Skipped));

        let mut step = StepRecord {
            status: Status::Running,
            ..Default::default()
        };
        assert!(!step.transition(Status::Skipped));
    }

    #[test]
    fn log_appends_never_truncate() {
        let mut log = LogRecord {
            number: 1,
            ..Default::default()
        };
        log.append(b"hello\n");
        log.append(b"world\n");
        assert_eq!(log.data, b"hello\nworld\n");
    }
}
