//! Durable per-stage checkpoint records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RecordStatus;

/// Bookkeeping stored alongside a record's payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Run that wrote the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Hash of the upstream outputs the stage consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    /// Processor attempts used.
    #[serde(default)]
    pub attempts: u32,
    /// Wall-clock execution time across attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl RecordMetadata {
    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The outcome of one stage for one organization.
///
/// Keyed by `(organization_id, stage_id)`; the last write for a key wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Organization the record belongs to.
    pub organization_id: String,
    /// Stage that produced it.
    pub stage_id: String,
    /// Record status.
    pub status: RecordStatus,
    /// Stage payload, present when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Failure reason, present when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// Run bookkeeping.
    #[serde(default, skip_serializing_if = "RecordMetadata::is_empty")]
    pub metadata: RecordMetadata,
}

impl StageRecord {
    /// Creates a record for a stage that has started executing.
    #[must_use]
    pub fn running(organization_id: impl Into<String>, stage_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            stage_id: stage_id.into(),
            status: RecordStatus::Running,
            payload: None,
            error: None,
            timestamp: Utc::now(),
            metadata: RecordMetadata::default(),
        }
    }

    /// Creates a completed record.
    #[must_use]
    pub fn completed(
        organization_id: impl Into<String>,
        stage_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            status: RecordStatus::Completed,
            payload: Some(payload),
            ..Self::running(organization_id, stage_id)
        }
    }

    /// Creates a failed record.
    #[must_use]
    pub fn failed(
        organization_id: impl Into<String>,
        stage_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: RecordStatus::Failed,
            error: Some(error.into()),
            ..Self::running(organization_id, stage_id)
        }
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: RecordMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns true if the stage completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == RecordStatus::Completed
    }

    /// Returns true if the stage failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == RecordStatus::Failed
    }

    /// Returns the payload of a completed record.
    #[must_use]
    pub fn completed_payload(&self) -> Option<&serde_json::Value> {
        if self.is_completed() {
            self.payload.as_ref()
        } else {
            None
        }
    }
}
