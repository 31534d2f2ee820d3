//! The immutable pipeline model.
//!
//! Pipelines arrive pre-compiled from the control plane; the worker never
//! mutates them. Per-execution state lives in [`crate::record`].

use serde::{Deserialize, Serialize};

use crate::container::Container;
use crate::secret::SecretSpec;

/// A compiled pipeline: the full description of one build's containers and
/// their ordering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    #[serde(default)]
    pub version: String,
    /// Routing labels the executing worker must offer.
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub services: Vec<Container>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,
    #[serde(default)]
    pub volume: Volume,
    #[serde(default)]
    pub network: Network,
}

impl Pipeline {
    /// All step containers in declared order, flattened across stages.
    pub fn steps(&self) -> impl Iterator<Item = &Container> {
        self.stages.iter().flat_map(|stage| stage.steps.iter())
    }
}

/// An ordered group of steps. Stages may run concurrently subject to their
/// `needs` dependencies; steps within a stage run sequentially.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Container>,
}

/// The shared build volume mounted into every container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub destination: String,
    #[serde(default = "default_access_mode")]
    pub access_mode: String,
}

impl Default for Volume {
    fn default() -> Self {
        Self {
            name: String::new(),
            destination: "/workspace".to_string(),
            access_mode: default_access_mode(),
        }
    }
}

fn default_access_mode() -> String {
    "rw".to_string()
}

/// The build-scoped network containers attach to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    #[serde(default = "default_network_driver")]
    pub driver: String,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            name: String::new(),
            driver: default_network_driver(),
        }
    }
}

fn default_network_driver() -> String {
    "bridge".to_string()
}
