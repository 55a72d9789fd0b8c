//! Observable run state and the run derived from stored records.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::resume;
use crate::core::{RunStatus, StageRecord, StageStatus, SynthesisArtifact};
use crate::registry::StageRegistry;

/// Status of one stage as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    /// Stage id.
    pub stage_id: String,
    /// Display name.
    pub display_name: String,
    /// Current status.
    pub status: StageStatus,
}

/// Snapshot of a run, published to handles on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Organization being analysed.
    pub organization_id: String,
    /// Run id.
    pub run_id: String,
    /// Overall status.
    pub status: RunStatus,
    /// Position of the stage in flight.
    pub current_index: Option<usize>,
    /// Where the run resumed, once decided.
    pub resume_index: Option<usize>,
    /// True when the artifact came from the store without invoking a stage.
    pub from_cache: bool,
    /// Per-stage status in sequence order.
    pub stages: Vec<StageState>,
}

impl RunState {
    /// Creates an idle state with every stage pending.
    #[must_use]
    pub fn new(registry: &StageRegistry, organization_id: &str, run_id: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            run_id: run_id.to_string(),
            status: RunStatus::Idle,
            current_index: None,
            resume_index: None,
            from_cache: false,
            stages: registry
                .stages()
                .iter()
                .map(|stage| StageState {
                    stage_id: stage.id().to_string(),
                    display_name: stage.display_name().to_string(),
                    status: StageStatus::Pending,
                })
                .collect(),
        }
    }

    /// The stage in flight, if any.
    #[must_use]
    pub fn current_stage(&self) -> Option<&StageState> {
        self.current_index.and_then(|index| self.stages.get(index))
    }

    /// Number of stages that completed.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.count(StageStatus::Completed)
    }

    /// Number of stages that failed.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.count(StageStatus::Failed)
    }

    /// Number of stages in a terminal state.
    #[must_use]
    pub fn terminal_count(&self) -> usize {
        self.stages.iter().filter(|s| s.status.is_terminal()).count()
    }

    /// Status of a stage by id.
    #[must_use]
    pub fn stage_status(&self, stage_id: &str) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|s| s.stage_id == stage_id)
            .map(|s| s.status)
    }

    pub(crate) fn set_stage(&mut self, index: usize, status: StageStatus) {
        if let Some(stage) = self.stages.get_mut(index) {
            stage.status = status;
        }
    }

    /// Copies record statuses onto stages before `until`.
    pub(crate) fn apply_records(&mut self, records: &HashMap<String, StageRecord>, until: usize) {
        for stage in self.stages.iter_mut().take(until) {
            stage.status = records
                .get(&stage.stage_id)
                .map_or(StageStatus::Pending, |record| record.status.into());
        }
    }

    fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }
}

/// The logical run for one organization, derived from its stored records.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    /// Organization the records belong to.
    pub organization_id: String,
    /// `Complete` once the synthesis record is completed, otherwise `Idle`.
    pub status: RunStatus,
    /// Per-stage status taken from the records.
    pub stages: Vec<StageState>,
    /// Where the next run would resume; `None` when nothing is left to do.
    pub resume_index: Option<usize>,
    /// The records themselves, keyed by stage id.
    pub records: HashMap<String, StageRecord>,
}

impl PipelineRun {
    /// Derives the run from an organization's records.
    #[must_use]
    pub fn derive(
        registry: &StageRegistry,
        organization_id: &str,
        records: HashMap<String, StageRecord>,
    ) -> Self {
        let mut state = RunState::new(registry, organization_id, "");
        state.apply_records(&records, registry.len());

        let complete = records
            .get(registry.synthesis().id())
            .is_some_and(StageRecord::is_completed);

        Self {
            organization_id: organization_id.to_string(),
            status: if complete { RunStatus::Complete } else { RunStatus::Idle },
            stages: state.stages,
            resume_index: resume::resume_index(registry, &records),
            records,
        }
    }

    /// Returns true if the synthesis record is completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Complete
    }

    /// Assembles the stored artifact, if synthesis completed.
    #[must_use]
    pub fn artifact(&self, registry: &StageRegistry) -> Option<SynthesisArtifact> {
        SynthesisArtifact::assemble(registry, &self.organization_id, &self.records)
    }
}
