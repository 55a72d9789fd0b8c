//! The caller-facing synthesis artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::StageRecord;
use crate::registry::StageRegistry;

/// Output of the synthesis stage together with the upstream sections it drew on.
///
/// Upstream stages that failed or never ran are listed in `missing_sections`
/// rather than treated as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisArtifact {
    /// Organization the artifact describes.
    pub organization_id: String,
    /// Payload of the synthesis stage.
    pub analysis: serde_json::Value,
    /// Completed upstream payloads keyed by stage id.
    pub sections: BTreeMap<String, serde_json::Value>,
    /// Upstream stage ids without a completed record, in sequence order.
    pub missing_sections: Vec<String>,
    /// When the synthesis record was written.
    pub generated_at: DateTime<Utc>,
}

impl SynthesisArtifact {
    /// Assembles the artifact from an organization's records.
    ///
    /// Returns `None` unless the synthesis stage has a completed record.
    #[must_use]
    pub fn assemble(
        registry: &StageRegistry,
        organization_id: &str,
        records: &HashMap<String, StageRecord>,
    ) -> Option<Self> {
        let synthesis = records.get(registry.synthesis().id())?;
        let analysis = synthesis.completed_payload()?.clone();

        let mut sections = BTreeMap::new();
        let mut missing_sections = Vec::new();
        for stage in registry.upstream() {
            match records.get(stage.id()).and_then(StageRecord::completed_payload) {
                Some(payload) => {
                    sections.insert(stage.id().to_string(), payload.clone());
                }
                None => missing_sections.push(stage.id().to_string()),
            }
        }

        Some(Self {
            organization_id: organization_id.to_string(),
            analysis,
            sections,
            missing_sections,
            generated_at: synthesis.timestamp,
        })
    }

    /// Returns an upstream section, if it is available.
    #[must_use]
    pub fn section(&self, stage_id: &str) -> Option<&serde_json::Value> {
        self.sections.get(stage_id)
    }

    /// Returns true if any upstream section is missing.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.missing_sections.is_empty()
    }
}
