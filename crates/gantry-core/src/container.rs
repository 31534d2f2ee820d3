//! Container units of execution.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ruleset::Ruleset;

/// Name of the synthetic first step. It is reported to the control plane
/// but never given a container of its own.
pub const INIT_STEP: &str = "init";

/// A single unit of container execution within a pipeline.
///
/// `id` is unique within the pipeline and doubles as the runtime-side
/// resource name. `number` is positive and stable for the lifetime of one
/// pipeline execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub number: i64,
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// If true, execution returns after start without waiting.
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub pull: Pull,
    #[serde(default)]
    pub secrets: Vec<SecretRef>,
    #[serde(default)]
    pub ruleset: Ruleset,
}

impl Container {
    pub fn is_init(&self) -> bool {
        self.name == INIT_STEP
    }
}

/// Image pull policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pull {
    /// Pull before every run.
    Always,
    /// Pull only when the image is absent locally.
    #[default]
    NotPresent,
    /// Never pull; fail if the image is absent.
    Never,
}

/// A request to inject a named secret into a container's environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretRef {
    /// Name of the secret in the build's secret map.
    pub source: String,
    /// Environment variable to populate.
    pub target: String,
}
