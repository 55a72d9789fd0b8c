//! Core domain model types for orgflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Organization context
//! - Stage, record and run status enums
//! - Durable stage records
//! - The synthesis artifact

mod artifact;
mod organization;
mod record;
mod status;

pub use artifact::SynthesisArtifact;
pub use organization::Organization;
pub use record::{RecordMetadata, StageRecord};
pub use status::{RecordStatus, RunStatus, StageStatus};
