//! In-memory checkpoint store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

use super::{CheckpointError, CheckpointStore};
use crate::core::StageRecord;

/// Checkpoint store backed by a concurrent map.
///
/// Each organization owns one map entry, so runs for different
/// organizations never contend on the same shard lock for long.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: DashMap<String, HashMap<String, StageRecord>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = StageRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Returns the number of records stored for an organization.
    #[must_use]
    pub fn record_count(&self, organization_id: &str) -> usize {
        self.records.get(organization_id).map_or(0, |r| r.len())
    }

    /// Returns the number of organizations with at least one record.
    #[must_use]
    pub fn organization_count(&self) -> usize {
        self.records.len()
    }

    fn insert(&self, record: StageRecord) {
        self.records
            .entry(record.organization_id.clone())
            .or_default()
            .insert(record.stage_id.clone(), record);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, organization_id: &str) -> Result<HashMap<String, StageRecord>, CheckpointError> {
        Ok(self
            .records
            .get(organization_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn put(&self, record: StageRecord) -> Result<(), CheckpointError> {
        self.insert(record);
        Ok(())
    }

    async fn invalidate(&self, organization_id: &str, stage_id: &str) -> Result<bool, CheckpointError> {
        Ok(self
            .records
            .get_mut(organization_id)
            .is_some_and(|mut r| r.remove(stage_id).is_some()))
    }
}
