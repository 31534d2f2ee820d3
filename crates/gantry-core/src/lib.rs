//! Core domain types for the Gantry build worker.
//!
//! This crate contains:
//! - The immutable pipeline model delivered by the control plane
//! - Container units and their gating rulesets
//! - Mutable build/step/service records and append-only logs
//! - Secrets and their injection constraints
//! - The queue envelope and route matching
//! - The shared error taxonomy and retry policy

pub mod container;
pub mod error;
pub mod item;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod ruleset;
pub mod secret;
pub mod status;

pub use container::{Container, Pull, SecretRef};
pub use error::{Error, Result};
pub use item::{BuildPackage, Repo, User};
pub use pipeline::{Network, Pipeline, Stage, Volume};
pub use record::{BuildRecord, LogRecord, ServiceRecord, StepRecord};
pub use ruleset::{RuleData, Rules, Ruleset};
pub use secret::{Secret, SecretSpec};
pub use status::Status;
