//! Durable stage checkpoints.
//!
//! A checkpoint store persists one [`StageRecord`] per
//! `(organization, stage)` with overwrite semantics. The controller reads an
//! organization's records once at the start of every run to decide where to
//! resume, and writes each stage's terminal record before moving on.
//!
//! Backends:
//! - [`InMemoryCheckpointStore`] for tests and single-process use
//! - [`FileCheckpointStore`] writing one JSON document per organization

mod file;
mod memory;

pub(crate) use file::file_stem;
pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::StageRecord;

/// Errors raised by checkpoint backends.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The backend could not be reached.
    #[error("checkpoint backend unavailable: {0}")]
    Unavailable(String),

    /// A filesystem operation failed.
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Stored data could not be decoded.
    #[error("corrupt checkpoint for organization '{organization_id}': {message}")]
    Corrupt {
        /// Organization whose checkpoint is unreadable.
        organization_id: String,
        /// Decoder message.
        message: String,
    },

    /// A record could not be encoded.
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CheckpointError {
    /// True for errors a retry may clear.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Storage backend for stage records.
///
/// Implementations must tolerate concurrent calls for distinct
/// organizations without interference.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns every record stored for an organization, keyed by stage id.
    ///
    /// An organization with no records yields an empty map.
    async fn get(&self, organization_id: &str) -> Result<HashMap<String, StageRecord>, CheckpointError>;

    /// Writes a record, replacing any previous record for the same stage.
    async fn put(&self, record: StageRecord) -> Result<(), CheckpointError>;

    /// Removes one record out of band so the next run re-executes the stage.
    ///
    /// Returns true if a record was removed.
    async fn invalidate(&self, organization_id: &str, stage_id: &str) -> Result<bool, CheckpointError>;
}
