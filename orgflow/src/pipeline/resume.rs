//! Resume planning.
//!
//! Everything here is derived from persisted records, so the same decision
//! is reached after a process restart as inside a live run.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::config::ResumePolicy;
use crate::core::StageRecord;
use crate::executor::PriorOutputs;
use crate::registry::{StageDefinition, StageRegistry};

/// Where a run picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    /// The stored synthesis artifact can be returned without invoking any stage.
    Cached,
    /// Stages are driven in order starting at this position.
    ResumeAt(usize),
}

impl ResumeDecision {
    /// Returns the resume index, if any stage has to be driven.
    #[must_use]
    pub fn resume_index(self) -> Option<usize> {
        match self {
            Self::Cached => None,
            Self::ResumeAt(index) => Some(index),
        }
    }
}

/// Collects the completed outputs of every stage before `position`.
#[must_use]
pub fn prior_outputs(
    registry: &StageRegistry,
    records: &HashMap<String, StageRecord>,
    position: usize,
) -> PriorOutputs {
    let mut prior = PriorOutputs::new();
    for stage in registry.stages().iter().take(position) {
        if let Some(payload) = records.get(stage.id()).and_then(StageRecord::completed_payload) {
            prior.push(stage.id(), payload.clone());
        }
    }
    prior
}

/// SHA-256 of the canonical JSON of a stage's inputs, hex encoded.
///
/// Object keys inside payloads are serialized in sorted order, so equal
/// documents always hash equally.
#[must_use]
pub fn input_hash(prior: &PriorOutputs) -> String {
    let canonical: Vec<serde_json::Value> = prior
        .iter()
        .map(|(stage_id, payload)| serde_json::json!({ "stage_id": stage_id, "payload": payload }))
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(serde_json::Value::Array(canonical).to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns true if a stage has a completed record computed from the current
/// upstream outputs.
///
/// Records without an input hash were written out of band and are trusted.
#[must_use]
pub fn is_fresh(
    registry: &StageRegistry,
    records: &HashMap<String, StageRecord>,
    stage: &StageDefinition,
) -> bool {
    let Some(record) = records.get(stage.id()).filter(|r| r.is_completed()) else {
        return false;
    };
    match record.metadata.input_hash.as_deref() {
        None => true,
        Some(stored) => stored == input_hash(&prior_outputs(registry, records, stage.position())),
    }
}

/// First stage whose record is missing, not completed or stale.
///
/// Returns `None` when every stage is completed and fresh.
#[must_use]
pub fn resume_index(registry: &StageRegistry, records: &HashMap<String, StageRecord>) -> Option<usize> {
    registry
        .stages()
        .iter()
        .position(|stage| !is_fresh(registry, records, stage))
}

/// Decides where a run for these records should start.
#[must_use]
pub fn plan(
    registry: &StageRegistry,
    records: &HashMap<String, StageRecord>,
    policy: ResumePolicy,
) -> ResumeDecision {
    if policy == ResumePolicy::CacheFirst
        && records
            .get(registry.synthesis().id())
            .is_some_and(StageRecord::is_completed)
    {
        return ResumeDecision::Cached;
    }

    match resume_index(registry, records) {
        None => ResumeDecision::Cached,
        Some(index) => ResumeDecision::ResumeAt(index),
    }
}
