//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("transient runtime error: {0}")]
    RuntimeTransient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry at the same boundary may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RuntimeTransient(_))
    }

    /// Promote a transient error to its non-transient sibling after retry
    /// exhaustion.
    pub fn exhausted(self) -> Self {
        match self {
            Error::RuntimeTransient(msg) => Error::RuntimeUnavailable(msg),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::RuntimeTransient("daemon busy".into()).is_transient());
        assert!(!Error::RuntimeUnavailable("no socket".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn exhaustion_promotes_to_unavailable() {
        let err = Error::RuntimeTransient("daemon busy".into()).exhausted();
        assert!(matches!(err, Error::RuntimeUnavailable(_)));

        let err = Error::NotFound("gone".into()).exhausted();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
