//! Gating rules for container execution.

use serde::{Deserialize, Serialize};

use crate::status::Status;

/// Conditions under which a container executes, evaluated against the
/// build's metadata right before the container would run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    #[serde(default)]
    pub rules: Rules,
    /// When true a failing exit code is recorded but does not poison
    /// subsequent steps.
    #[serde(default, rename = "continue")]
    pub continue_on_error: bool,
}

/// Individual match lists. An empty list matches everything; a non-empty
/// list must contain the observed value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rules {
    #[serde(default)]
    pub branch: Vec<String>,
    #[serde(default)]
    pub event: Vec<String>,
    #[serde(default)]
    pub status: Vec<String>,
}

/// Build metadata a ruleset is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RuleData {
    pub branch: String,
    pub event: String,
    pub status: Status,
}

impl Ruleset {
    /// Whether the container should execute for the given build state.
    ///
    /// With no status rules a container runs only while the build is
    /// healthy; listing statuses explicitly lets a step opt in to running
    /// after a failure.
    pub fn matches(&self, data: &RuleData) -> bool {
        if !self.rules.branch.is_empty() && !self.rules.branch.contains(&data.branch) {
            return false;
        }
        if !self.rules.event.is_empty() && !self.rules.event.contains(&data.event) {
            return false;
        }
        if self.rules.status.is_empty() {
            return matches!(data.status, Status::Pending | Status::Running | Status::Success);
        }
        self.rules.status.contains(&data.status.to_string())
    }
}
