//! Secrets and their injection constraints.

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

/// A pipeline's request for a named secret, resolved against the secret
/// store at build start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretSpec {
    /// Name the pipeline refers to the secret by.
    pub name: String,
    /// Store path of the secret.
    pub key: String,
    /// Backing engine (e.g. "native", "vault").
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub kind: String,
}

/// A resolved secret. Read-only after population at build start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub kind: String,
    /// When set, the only container name this secret may be injected into.
    #[serde(default)]
    pub origin: Option<String>,
}

impl Secret {
    /// Refuse injection into a container the origin does not permit.
    pub fn allow_container(&self, container_name: &str) -> Result<()> {
        match &self.origin {
            Some(origin) if origin != container_name => Err(Error::PermissionDenied(format!(
                "secret {} is restricted to container {}",
                self.name, origin
            ))),
            _ => Ok(()),
        }
    }
}
