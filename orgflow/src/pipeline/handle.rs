//! Caller-side handle on a run.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

use super::RunState;
use crate::cancellation::CancellationToken;
use crate::core::{StageRecord, SynthesisArtifact};
use crate::errors::OrgflowError;
use crate::progress::{Progress, ProgressReporter};

/// Final outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Always true; failed runs resolve to an error instead.
    pub success: bool,
    /// Run that produced the report.
    pub run_id: String,
    /// Organization analysed.
    pub organization_id: String,
    /// The synthesis artifact.
    pub analysis: SynthesisArtifact,
    /// Every record for the organization, keyed by stage id.
    pub stage_outputs: BTreeMap<String, StageRecord>,
    /// True when no stage was invoked.
    pub from_cache: bool,
    /// Stages whose processor was invoked, in order.
    pub executed_stages: Vec<String>,
}

impl RunReport {
    /// Returns the record of a stage.
    #[must_use]
    pub fn record(&self, stage_id: &str) -> Option<&StageRecord> {
        self.stage_outputs.get(stage_id)
    }
}

pub(crate) type RunOutcome = Result<RunReport, OrgflowError>;

/// Shared channels of one active run.
#[derive(Debug, Clone)]
pub(crate) struct RunChannels {
    pub(crate) run_id: String,
    pub(crate) cancel: Arc<CancellationToken>,
    pub(crate) state: watch::Receiver<RunState>,
    pub(crate) outcome: watch::Receiver<Option<RunOutcome>>,
}

/// Handle returned by [`PipelineController::start`](super::PipelineController::start).
///
/// Every handle attached to the same run observes the same state and resolves
/// to the same outcome.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    organization_id: String,
    channels: RunChannels,
    attached: bool,
}

impl PipelineHandle {
    pub(crate) fn new(organization_id: impl Into<String>, channels: RunChannels, attached: bool) -> Self {
        Self {
            organization_id: organization_id.into(),
            channels,
            attached,
        }
    }

    /// Run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.channels.run_id
    }

    /// Organization id.
    #[must_use]
    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    /// True if `start` found this run already active and attached to it.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Latest run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.channels.state.borrow().clone()
    }

    /// Progress derived from the latest state.
    #[must_use]
    pub fn progress(&self) -> Progress {
        ProgressReporter::report(&self.channels.state.borrow())
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.channels.state.clone()
    }

    /// Requests cancellation. Returns false if the run was already cancelled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.channels.cancel.cancel(reason)
    }

    /// Returns true once the outcome is available.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.channels.outcome.borrow().is_some()
    }

    /// Waits for the run to finish.
    pub async fn wait(&self) -> Result<RunReport, OrgflowError> {
        let mut outcome = self.channels.outcome.clone();
        let waited = outcome
            .wait_for(Option::is_some)
            .await
            .map(|value| value.clone());
        let resolved = match waited {
            Ok(value) => value,
            // The sender is gone; an outcome may still have been published first.
            Err(_) => outcome.borrow().clone(),
        };
        resolved.unwrap_or_else(|| {
            Err(OrgflowError::Internal(format!(
                "run {} ended without an outcome",
                self.channels.run_id
            )))
        })
    }
}
