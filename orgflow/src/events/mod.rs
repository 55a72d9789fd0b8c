//! Run lifecycle events.
//!
//! The controller reports every transition of a run to an [`EventSink`].
//! Sinks must never block the run; emission failures are swallowed.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle transitions a run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Checkpoints are being read.
    #[serde(rename = "pipeline.checking")]
    PipelineChecking,
    /// The stored artifact was returned without invoking a stage.
    #[serde(rename = "pipeline.cache_hit")]
    PipelineCacheHit,
    /// The resume point was decided.
    #[serde(rename = "pipeline.resumed")]
    PipelineResumed,
    /// A stage processor was invoked.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A stage completed and its record was written.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A stage failed and its record was written.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A completed, fresh record was kept instead of re-invoking the stage.
    #[serde(rename = "stage.reused")]
    StageReused,
    /// A record could not be written after retries.
    #[serde(rename = "checkpoint.write_failed")]
    CheckpointWriteFailed,
    /// The synthesis artifact is available.
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,
    /// The run stopped with an error.
    #[serde(rename = "pipeline.failed")]
    PipelineFailed,
    /// The run was cancelled.
    #[serde(rename = "pipeline.cancelled")]
    PipelineCancelled,
    /// A run for the organization is already active.
    #[serde(rename = "pipeline.already_running")]
    PipelineAlreadyRunning,
}

impl EventKind {
    /// Dotted event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineChecking => "pipeline.checking",
            Self::PipelineCacheHit => "pipeline.cache_hit",
            Self::PipelineResumed => "pipeline.resumed",
            Self::StageStarted => "stage.started",
            Self::StageCompleted => "stage.completed",
            Self::StageFailed => "stage.failed",
            Self::StageReused => "stage.reused",
            Self::CheckpointWriteFailed => "checkpoint.write_failed",
            Self::PipelineCompleted => "pipeline.completed",
            Self::PipelineFailed => "pipeline.failed",
            Self::PipelineCancelled => "pipeline.cancelled",
            Self::PipelineAlreadyRunning => "pipeline.already_running",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// What happened.
    pub kind: EventKind,
    /// Organization of the run.
    pub organization_id: String,
    /// Run that emitted the event.
    pub run_id: String,
    /// Stage involved, for stage and checkpoint events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    /// Event-specific details.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    /// Creates a run-level event.
    #[must_use]
    pub fn new(kind: EventKind, organization_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            kind,
            organization_id: organization_id.into(),
            run_id: run_id.into(),
            stage_id: None,
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Attaches a stage id.
    #[must_use]
    pub fn with_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    /// Attaches details.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
