//! File-backed checkpoint store.
//!
//! Each organization's records live in one JSON document under the store
//! root: `{root}/{slug}-{hash}.json`.
//!
//! # Atomic Writes
//!
//! Updates use the atomic write pattern:
//! 1. Write the full document to `{file}.tmp` and sync it
//! 2. Rename over `{file}`
//!
//! A crash mid-write leaves the previous document intact.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CheckpointError, CheckpointStore};
use crate::core::StageRecord;

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDocument {
    version: u32,
    organization_id: String,
    records: BTreeMap<String, StageRecord>,
}

impl CheckpointDocument {
    fn empty(organization_id: &str) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            organization_id: organization_id.to_string(),
            records: BTreeMap::new(),
        }
    }
}

/// Checkpoint store writing one JSON document per organization.
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileCheckpointStore {
    /// Creates a store rooted at a directory. The directory is created on
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: DashMap::new(),
        }
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the document path for an organization.
    #[must_use]
    pub fn document_path(&self, organization_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", file_stem(organization_id)))
    }

    fn write_lock(&self, organization_id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(organization_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops the write lock entry once no writer holds or awaits it.
    fn release_write_lock(&self, organization_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.write_locks
            .remove_if(organization_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn load(&self, organization_id: &str) -> Result<CheckpointDocument, CheckpointError> {
        let path = self.document_path(organization_id);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(organization_id, "No checkpoint document, starting fresh");
                return Ok(CheckpointDocument::empty(organization_id));
            }
            Err(e) => return Err(CheckpointError::io(path, e)),
        };

        let document: CheckpointDocument =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
                organization_id: organization_id.to_string(),
                message: e.to_string(),
            })?;

        if document.organization_id != organization_id {
            return Err(CheckpointError::Corrupt {
                organization_id: organization_id.to_string(),
                message: format!(
                    "document belongs to organization '{}'",
                    document.organization_id
                ),
            });
        }

        Ok(document)
    }

    async fn save(&self, document: &CheckpointDocument) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CheckpointError::io(&self.root, e))?;

        let path = self.document_path(&document.organization_id);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(document)?;

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| CheckpointError::io(&tmp_path, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| CheckpointError::io(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| CheckpointError::io(&tmp_path, e))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| CheckpointError::io(&path, e))?;

        debug!(
            organization_id = %document.organization_id,
            records = document.records.len(),
            "Saved checkpoint document"
        );
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, organization_id: &str) -> Result<HashMap<String, StageRecord>, CheckpointError> {
        let document = self.load(organization_id).await?;
        Ok(document.records.into_iter().collect())
    }

    async fn put(&self, record: StageRecord) -> Result<(), CheckpointError> {
        let organization_id = record.organization_id.clone();
        let lock = self.write_lock(&organization_id);
        let guard = lock.lock().await;

        let written = async {
            let mut document = self.load(&organization_id).await?;
            document.version = DOCUMENT_VERSION;
            document.records.insert(record.stage_id.clone(), record);
            self.save(&document).await
        }
        .await;

        drop(guard);
        self.release_write_lock(&organization_id, lock);
        written
    }

    async fn invalidate(&self, organization_id: &str, stage_id: &str) -> Result<bool, CheckpointError> {
        let lock = self.write_lock(organization_id);
        let guard = lock.lock().await;

        let removed = async {
            let mut document = self.load(organization_id).await?;
            if document.records.remove(stage_id).is_none() {
                return Ok(false);
            }
            self.save(&document).await?;
            Ok::<_, CheckpointError>(true)
        }
        .await;

        drop(guard);
        self.release_write_lock(organization_id, lock);
        removed
    }
}

/// Filesystem-safe, collision-resistant name for an organization id.
pub(crate) fn file_stem(organization_id: &str) -> String {
    let slug: String = organization_id
        .chars()
        .take(48)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let digest = Sha256::digest(organization_id.as_bytes());
    format!("{slug}-{}", &hex::encode(digest)[..12])
}
