//! Per-organization run leases.
//!
//! The controller's in-process map of active runs only protects a single
//! instance. A [`RunLock`] extends the guard across processes sharing the
//! same checkpoint backend: a run acquires its organization's lease before
//! reading checkpoints and releases it when the lease is dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::checkpoint::file_stem;

/// Errors raised by lock backends.
#[derive(Debug, Error)]
pub enum LockError {
    /// A filesystem operation failed.
    #[error("run lock I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The lease could not be encoded.
    #[error("run lock serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LockError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A held lease. Dropping it releases the lock.
pub struct RunLease {
    organization_id: String,
    owner: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl RunLease {
    /// Creates a lease that runs `release` when dropped.
    pub fn new(
        organization_id: impl Into<String>,
        owner: impl Into<String>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            owner: owner.into(),
            release: Some(Box::new(release)),
        }
    }

    /// Organization the lease covers.
    #[must_use]
    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    /// Owner recorded when the lease was acquired.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for RunLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLease")
            .field("organization_id", &self.organization_id)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Backend for cross-instance run exclusion.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Tries to take the lease for an organization.
    ///
    /// Returns `Ok(None)` when another owner holds it.
    async fn try_acquire(&self, organization_id: &str, owner: &str) -> Result<Option<RunLease>, LockError>;
}

/// Lease table local to one process.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRunLock {
    holders: Arc<DashMap<String, String>>,
}

impl InMemoryRunLock {
    /// Creates an empty lease table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current owner of an organization's lease.
    #[must_use]
    pub fn holder(&self, organization_id: &str) -> Option<String> {
        self.holders.get(organization_id).map(|owner| owner.value().clone())
    }
}

#[async_trait]
impl RunLock for InMemoryRunLock {
    async fn try_acquire(&self, organization_id: &str, owner: &str) -> Result<Option<RunLease>, LockError> {
        match self.holders.entry(organization_id.to_string()) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                slot.insert(owner.to_string());
                let holders = Arc::clone(&self.holders);
                let (org, who) = (organization_id.to_string(), owner.to_string());
                Ok(Some(RunLease::new(organization_id, owner, move || {
                    holders.remove_if(&org, |_, current| *current == who);
                })))
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseFile {
    organization_id: String,
    owner: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
    /// Distinguishes two leases taken by the same owner.
    #[serde(default)]
    nonce: String,
}

/// What a contender found at the lease path.
enum Holder {
    Vacant,
    Live,
    /// Stale lease, with the bytes it was judged on.
    Stale(Vec<u8>),
}

/// Lease files in a shared directory.
///
/// A lease is written to a private temp file and published with a hard
/// link, so the lease path never holds a partial lease and only one
/// contender can publish. A lease older than `stale_after` is assumed to
/// belong to a crashed process and is reclaimed. Leases that fail to parse
/// age by file modification time.
#[derive(Debug, Clone)]
pub struct FileRunLock {
    dir: PathBuf,
    stale_after: Duration,
}

impl FileRunLock {
    /// Creates a lock over a directory, reclaiming leases after one hour.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stale_after: Duration::from_secs(3600),
        }
    }

    /// Sets the age after which a lease is reclaimed.
    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Path of an organization's lease file.
    #[must_use]
    pub fn lease_path(&self, organization_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(organization_id)))
    }

    /// Writes `lease` to a private file next to `path`.
    async fn write_temp(&self, path: &Path, lease: &LeaseFile) -> Result<PathBuf, LockError> {
        let tmp = sibling(path, "tmp");
        let bytes = serde_json::to_vec(lease)?;

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(LockError::io(&tmp, e));
        }
        Ok(tmp)
    }

    /// Publishes `lease` at `path` unless a lease is already there.
    async fn publish(&self, path: &Path, lease: &LeaseFile) -> Result<bool, LockError> {
        let tmp = self.write_temp(path, lease).await?;

        let linked = tokio::fs::hard_link(&tmp, path).await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            debug!(path = %tmp.display(), error = %e, "Failed to remove lease temp file");
        }

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(LockError::io(path, e)),
        }
    }

    /// Replaces the stale lease `snapshot` with `lease`.
    ///
    /// Contenders that judged the same lease stale serialize on a guard
    /// file named after it, and the winner swaps the lease in with a
    /// rename, so the lease path is never empty while it is reclaimed.
    async fn reclaim(&self, path: &Path, snapshot: &[u8], lease: &LeaseFile) -> Result<bool, LockError> {
        let mut name = path.file_name().map(OsString::from).unwrap_or_default();
        name.push(format!(".{}.reclaim", &hex::encode(Sha256::digest(snapshot))[..16]));
        let guard = path.with_file_name(name);

        if !self.take_guard(&guard).await? {
            return Ok(false);
        }
        let replaced = self.replace_if_unchanged(path, snapshot, lease).await;
        if let Err(e) = tokio::fs::remove_file(&guard).await {
            debug!(path = %guard.display(), error = %e, "Failed to remove reclaim guard");
        }
        replaced
    }

    async fn take_guard(&self, guard: &Path) -> Result<bool, LockError> {
        for _ in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(guard)
                .await
            {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(LockError::io(guard, e)),
            }

            // Left behind by a reclaimer that died mid-way.
            let modified = match tokio::fs::metadata(guard).await.and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(LockError::io(guard, e)),
            };
            if SystemTime::now().duration_since(modified).unwrap_or_default() <= self.stale_after {
                return Ok(false);
            }
            warn!(path = %guard.display(), "Removing abandoned reclaim guard");
            match tokio::fs::remove_file(guard).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(LockError::io(guard, e)),
            }
        }
        Ok(false)
    }

    async fn replace_if_unchanged(&self, path: &Path, snapshot: &[u8], lease: &LeaseFile) -> Result<bool, LockError> {
        match tokio::fs::read(path).await {
            Ok(current) if current == snapshot => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => return self.publish(path, lease).await,
            Err(e) => return Err(LockError::io(path, e)),
        }

        let tmp = self.write_temp(path, lease).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(LockError::io(path, e));
        }
        Ok(true)
    }

    async fn inspect(&self, path: &Path) -> Result<Holder, LockError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Vacant),
            Err(e) => return Err(LockError::io(path, e)),
        };

        let age = if let Ok(existing) = serde_json::from_slice::<LeaseFile>(&bytes) {
            Utc::now()
                .signed_duration_since(existing.acquired_at)
                .to_std()
                .unwrap_or_default()
        } else {
            let modified = match tokio::fs::metadata(path).await.and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Vacant),
                Err(e) => return Err(LockError::io(path, e)),
            };
            warn!(path = %path.display(), "Unreadable lease file");
            SystemTime::now().duration_since(modified).unwrap_or_default()
        };

        if age > self.stale_after {
            Ok(Holder::Stale(bytes))
        } else {
            Ok(Holder::Live)
        }
    }
}

#[async_trait]
impl RunLock for FileRunLock {
    async fn try_acquire(&self, organization_id: &str, owner: &str) -> Result<Option<RunLease>, LockError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| LockError::io(&self.dir, e))?;

        let path = self.lease_path(organization_id);
        let nonce = Uuid::new_v4().to_string();
        let lease = LeaseFile {
            organization_id: organization_id.to_string(),
            owner: owner.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
            nonce: nonce.clone(),
        };

        let mut acquired = self.publish(&path, &lease).await?;
        if !acquired {
            acquired = match self.inspect(&path).await? {
                Holder::Live => false,
                Holder::Vacant => self.publish(&path, &lease).await?,
                Holder::Stale(snapshot) => {
                    warn!(organization_id, path = %path.display(), "Reclaiming stale run lease");
                    self.reclaim(&path, &snapshot, &lease).await?
                }
            };
        }

        if !acquired {
            debug!(organization_id, "Run lease held elsewhere");
            return Ok(None);
        }

        Ok(Some(RunLease::new(organization_id, owner, move || {
            release_lease_file(&path, &nonce);
        })))
    }
}

/// A unique name next to `path`.
fn sibling(path: &Path, tag: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(".{}.{tag}", Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// Removes the file at `path` if its content satisfies `expected`.
///
/// The file is renamed aside before it is checked, so a lease swapped in
/// after the caller's last read is never deleted. A file that fails the
/// check is linked back into place. Returns whether the file was removed.
fn take_if(path: &Path, expected: impl FnOnce(&[u8]) -> bool) -> std::io::Result<bool> {
    let aside = sibling(path, "reclaim");
    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }

    let matches = std::fs::read(&aside).is_ok_and(|bytes| expected(&bytes));
    if !matches {
        match std::fs::hard_link(&aside, path) {
            Ok(()) => debug!(path = %path.display(), "Put back a lease that changed under us"),
            Err(e) => warn!(path = %path.display(), error = %e, "Could not put back a moved lease"),
        }
    }
    std::fs::remove_file(&aside)?;
    Ok(matches)
}

/// Removes a lease file if it is still the one published with `nonce`.
fn release_lease_file(path: &Path, nonce: &str) {
    let is_ours = |bytes: &[u8]| {
        serde_json::from_slice::<LeaseFile>(bytes).is_ok_and(|lease| lease.nonce == nonce)
    };
    let still_ours = std::fs::read(path).is_ok_and(|bytes| is_ours(&bytes));
    if !still_ours {
        return;
    }
    if let Err(e) = take_if(path, is_ours) {
        warn!(path = %path.display(), error = %e, "Failed to release run lease");
    }
}
