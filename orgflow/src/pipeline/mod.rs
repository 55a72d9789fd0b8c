//! Run orchestration.
//!
//! This module provides:
//! - The [`PipelineController`] state machine and its builder
//! - Caller handles and run reports
//! - Resume planning from stored records
//! - Per-organization run leases
//! - Configuration and retry policies

mod config;
mod controller;
mod handle;
mod lock;
pub mod resume;
mod retry;
mod state;

#[cfg(test)]
mod integration_tests;

pub use config::{PipelineConfig, ResumePolicy};
pub use controller::{PipelineController, PipelineControllerBuilder};
pub use handle::{PipelineHandle, RunReport};
pub use lock::{FileRunLock, InMemoryRunLock, LockError, RunLease, RunLock};
pub use resume::ResumeDecision;
pub use retry::{with_retry, with_retry_if, BackoffStrategy, JitterStrategy, RetryConfig};
pub use state::{PipelineRun, RunState, StageState};
