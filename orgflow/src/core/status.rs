//! Stage, record and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The in-memory status of one stage within an active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not started in this run.
    #[default]
    Pending,
    /// Stage processor is in flight.
    Running,
    /// Stage finished with a payload.
    Completed,
    /// Stage finished with an error.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl From<RecordStatus> for StageStatus {
    fn from(status: RecordStatus) -> Self {
        match status {
            RecordStatus::Running => Self::Running,
            RecordStatus::Completed => Self::Completed,
            RecordStatus::Failed => Self::Failed,
        }
    }
}

/// The status stored on a [`StageRecord`](super::StageRecord).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Stage began executing; never counts toward resumption.
    Running,
    /// Stage completed with a payload.
    Completed,
    /// Stage failed; its section is absent downstream.
    Failed,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Overall status of a pipeline run for one organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No run active and no completed synthesis.
    #[default]
    Idle,
    /// Reading checkpoints to decide the resume point.
    Checking,
    /// Driving stages.
    Running,
    /// Synthesis completed; the artifact is available.
    Complete,
    /// The last run stopped without completing (terminal failure or cancel).
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Checking => write!(f, "checking"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl RunStatus {
    /// Returns true while a run is executing.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Checking | Self::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn test_record_status_serialize() {
        let json = serde_json::to_string(&RecordStatus::Completed).unwrap();
        assert_eq!(json, r#""completed""#);

        let status: RecordStatus = serde_json::from_str(r#""failed""#).unwrap();
        assert_eq!(status, RecordStatus::Failed);
    }

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Checking.to_string(), "checking");
        assert!(RunStatus::Running.is_active());
        assert!(!RunStatus::Complete.is_active());
    }

    #[test]
    fn test_stage_status_from_record() {
        assert_eq!(StageStatus::from(RecordStatus::Failed), StageStatus::Failed);
    }
}
