//! Human-readable progress derived from run state.
//!
//! Reporting is a pure function of a [`RunState`]: it never touches the
//! checkpoint store and can be recomputed at any time.

use serde::{Deserialize, Serialize};

use crate::core::{RunStatus, StageStatus};
use crate::pipeline::RunState;

/// A progress snapshot for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Overall run status.
    pub phase: RunStatus,
    /// Phase label.
    pub label: String,
    /// Completion percentage, 0 to 100.
    pub percent: u8,
    /// Display name of the stage in flight.
    pub current_stage: Option<String>,
    /// Stages completed.
    pub completed: usize,
    /// Stages failed.
    pub failed: usize,
    /// Stages in the registry.
    pub total: usize,
}

/// Maps run state to [`Progress`].
///
/// Remembers the last percentage so a stopped run keeps showing how far it got.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressReporter {
    last_percent: u8,
}

impl ProgressReporter {
    /// Creates a reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports progress and remembers the percentage.
    pub fn observe(&mut self, state: &RunState) -> Progress {
        let progress = Self::report_from(state, self.last_percent);
        self.last_percent = progress.percent;
        progress
    }

    /// Reports progress for a single snapshot.
    ///
    /// A failed run shows the share of stages that reached a terminal state.
    #[must_use]
    pub fn report(state: &RunState) -> Progress {
        let last = running_percent(state);
        Self::report_from(state, last)
    }

    fn report_from(state: &RunState, last_percent: u8) -> Progress {
        let total = state.stages.len();
        let (label, percent) = match state.status {
            RunStatus::Idle => ("Waiting to start".to_string(), 0),
            RunStatus::Checking => ("Checking saved progress".to_string(), 0),
            RunStatus::Running => (running_label(state), running_percent(state)),
            RunStatus::Complete => ("Analysis complete".to_string(), 100),
            RunStatus::Failed => ("Analysis stopped".to_string(), last_percent),
        };

        Progress {
            phase: state.status,
            label,
            percent,
            current_stage: state
                .current_stage()
                .filter(|stage| stage.status == StageStatus::Running)
                .map(|stage| stage.display_name.clone()),
            completed: state.completed_count(),
            failed: state.failed_count(),
            total,
        }
    }
}

fn running_label(state: &RunState) -> String {
    let total = state.stages.len();
    match (state.current_index, state.current_stage()) {
        (Some(index), Some(stage)) => format!("Running {} ({}/{})", stage.display_name, index + 1, total),
        _ => format!("Running (0/{total})"),
    }
}

fn running_percent(state: &RunState) -> u8 {
    let total = state.stages.len();
    if total == 0 {
        return 0;
    }
    let percent = state.terminal_count() * 100 / total;
    u8::try_from(percent.min(99)).unwrap_or(99)
}
