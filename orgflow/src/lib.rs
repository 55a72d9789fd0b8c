//! # Orgflow
//!
//! Resumable, checkpointed analysis pipelines run per organization.
//!
//! A pipeline is a fixed sequence of stages ending in a synthesis stage.
//! Every stage's result is written to a [`CheckpointStore`](checkpoint::CheckpointStore)
//! before the next stage starts, so an interrupted or partially failed run
//! picks up where it stopped:
//!
//! - **Resume from checkpoints**: completed, fresh records are never recomputed
//! - **Partial-failure tolerance**: a failed upstream stage becomes a missing
//!   section of the final artifact
//! - **Reentrancy**: a second `start` for the same organization attaches to
//!   the active run
//! - **Observability**: lifecycle events, progress reporting and `tracing` spans
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use orgflow::prelude::*;
//!
//! let registry = StageRegistry::builder()
//!     .stage("competitors", "Competitor Landscape")
//!     .stage("media", "Media Coverage")
//!     .synthesis("synthesis", "Synthesis")
//!     .build()?;
//!
//! let controller = PipelineController::builder(registry)
//!     .store(Arc::new(FileCheckpointStore::new("/var/lib/orgflow")))
//!     .processor(Arc::new(HttpStageProcessor::new("http://analysis.internal/stages")))
//!     .build()?;
//!
//! let report = controller.run(Organization::named("Acme Corp")).await?;
//! println!("{}", report.analysis.analysis);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod checkpoint;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod observability;
pub mod pipeline;
pub mod progress;
pub mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::{
        CheckpointError, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
    };
    pub use crate::core::{
        Organization, RecordStatus, RunStatus, StageRecord, StageStatus, SynthesisArtifact,
    };
    pub use crate::errors::{OrgflowError, RegistryError};
    pub use crate::events::{
        CollectingEventSink, EventKind, EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent,
    };
    #[cfg(feature = "http")]
    pub use crate::executor::HttpStageProcessor;
    pub use crate::executor::{
        FnProcessor, PriorOutputs, ProcessorRouter, StageProcessor, StageRequest, StageResponse,
    };
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        FileRunLock, InMemoryRunLock, PipelineConfig, PipelineController, PipelineHandle,
        PipelineRun, ResumePolicy, RetryConfig, RunLock, RunReport, RunState,
    };
    pub use crate::progress::{Progress, ProgressReporter};
    pub use crate::registry::{StageDefinition, StageRegistry};
    pub use std::sync::Arc;
}
