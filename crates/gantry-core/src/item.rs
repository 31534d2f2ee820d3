//! The queue envelope a worker claims.

use serde::{Deserialize, Serialize};

use crate::pipeline::Pipeline;
use crate::record::BuildRecord;

/// Everything a worker needs to execute one build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPackage {
    pub build: BuildRecord,
    pub repo: Repo,
    pub pipeline: Pipeline,
    #[serde(default)]
    pub user: User,
}

impl BuildPackage {
    /// Routing labels this item requires of a worker.
    pub fn routes(&self) -> &[String] {
        &self.pipeline.routes
    }

    /// Subset-based route matching: every label the item carries must be
    /// offered by the worker. Items with no labels run anywhere.
    pub fn eligible(&self, offered: &[String]) -> bool {
        self.routes().iter().all(|route| offered.contains(route))
    }
}

/// Repository a build belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub org: String,
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default)]
    pub branch: String,
    /// Per-build wall clock bound in minutes; zero means the worker
    /// default applies.
    #[serde(default)]
    pub timeout: i64,
}

/// User that triggered the build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
}
