//! Stage execution.
//!
//! A [`StageProcessor`] is the black box that computes one stage. The
//! [`StageExecutor`] bounds each call with a timeout, retries failed
//! attempts and stops early when the run is cancelled.

#[cfg(feature = "http")]
mod http;
mod processor;
mod runner;

#[cfg(feature = "http")]
pub use http::HttpStageProcessor;
pub use processor::{
    FnProcessor, PriorOutputs, ProcessorRouter, StageProcessor, StageRequest, StageResponse,
};
pub use runner::{FailureKind, StageExecutor, StageFailure, StageSuccess};
