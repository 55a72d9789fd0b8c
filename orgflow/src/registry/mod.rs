//! Stage registry.
//!
//! The registry fixes the total, linear order of stages. The last stage is
//! always the synthesis stage, whose completed record marks a run Complete.

mod definition;
mod sequence;

pub use definition::{PayloadError, StageDefinition};
pub use sequence::{StageRegistry, StageRegistryBuilder};
