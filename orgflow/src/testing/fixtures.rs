//! Shared fixtures.

use serde_json::json;
use std::collections::HashMap;

use crate::core::{Organization, RecordMetadata, StageRecord};
use crate::pipeline::resume;
use crate::registry::StageRegistry;

/// The five-stage market analysis registry:
/// `[competitors, media, regulatory, trends, synthesis]`.
///
/// Synthesis payloads must carry a `summary` field.
#[must_use]
pub fn market_registry() -> StageRegistry {
    StageRegistry::builder()
        .stage("competitors", "Competitor Landscape")
        .stage("media", "Media Coverage")
        .stage("regulatory", "Regulatory Landscape")
        .stage("trends", "Industry Trends")
        .synthesis("synthesis", "Synthesis")
        .requires(&["summary"])
        .build()
        .expect("market registry is valid")
}

/// "Acme Corp", a manufacturing organization.
#[must_use]
pub fn acme() -> Organization {
    Organization::named("Acme Corp")
        .with_industry("Manufacturing")
        .with_field("headquarters", json!("Springfield"))
}

/// An organization with only a name.
#[must_use]
pub fn organization(name: &str) -> Organization {
    Organization::named(name)
}

/// Completed records for `stage_ids`, stamped with the input hashes the
/// controller would have written when running them in sequence order.
#[must_use]
pub fn completed_records(
    registry: &StageRegistry,
    organization_id: &str,
    stage_ids: &[&str],
) -> Vec<StageRecord> {
    let mut records: HashMap<String, StageRecord> = HashMap::new();
    let mut written = Vec::new();

    for stage in registry.stages() {
        if !stage_ids.contains(&stage.id()) {
            continue;
        }
        let prior = resume::prior_outputs(registry, &records, stage.position());
        let record = StageRecord::completed(
            organization_id,
            stage.id(),
            json!({ "stage": stage.id(), "summary": format!("stored {}", stage.id()) }),
        )
        .with_metadata(RecordMetadata {
            run_id: Some("seed".to_string()),
            input_hash: Some(resume::input_hash(&prior)),
            attempts: 1,
            duration_ms: Some(1),
        });
        records.insert(stage.id().to_string(), record.clone());
        written.push(record);
    }
    written
}
