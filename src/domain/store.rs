//! Snapshot persistence — atomic file I/O with SHA-256 integrity.
//!
//! The last good snapshot is written after each successful refresh and
//! restored at startup, so a daemon restart serves (explicitly stale) data
//! instead of a cold-start error while the first collection runs.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StatusError};

use super::model::Snapshot;

/// A snapshot wrapped with integrity metadata for disk storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    /// SHA-256 over the serialized snapshot: "sha256:<hex>".
    pub checksum: String,
    pub saved_at: DateTime<Utc>,
    pub daemon_version: String,
    pub snapshot: Snapshot,
}

impl StoredSnapshot {
    pub fn new(snapshot: Snapshot) -> Self {
        let serialized = serde_json::to_string(&snapshot).unwrap_or_default();
        let hash = Sha256::digest(serialized.as_bytes());
        Self {
            checksum: format!("sha256:{:x}", hash),
            saved_at: Utc::now(),
            daemon_version: env!("CARGO_PKG_VERSION").to_string(),
            snapshot,
        }
    }

    pub fn age_secs(&self) -> i64 {
        Utc::now().signed_duration_since(self.saved_at).num_seconds()
    }

    /// Whether the checksum still matches the payload.
    pub fn verify(&self) -> bool {
        let serialized = serde_json::to_string(&self.snapshot).unwrap_or_default();
        let hash = Sha256::digest(serialized.as_bytes());
        self.checksum == format!("sha256:{:x}", hash)
    }
}

pub struct SnapshotStore {
    path: PathBuf,
    /// Serializes writers and tracks the highest generation written.
    /// Persists run on detached tasks, so a slow write must not replace a
    /// newer snapshot already on disk.
    write_lock: Mutex<u64>,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Atomically persist a snapshot: serialize to a `.tmp` sibling, then
    /// rename over the final path so the file is always complete. A write
    /// carrying a lower generation than one already written is dropped.
    pub async fn write(&self, stored: &StoredSnapshot) -> Result<()> {
        let mut last_written = self.write_lock.lock().await;
        if stored.snapshot.generation < *last_written {
            debug!(
                generation = stored.snapshot.generation,
                last_written = *last_written,
                "skipping persist of an outdated snapshot"
            );
            return Ok(());
        }

        let content = serde_json::to_string_pretty(stored)
            .map_err(|e| StatusError::Internal(format!("serializing snapshot: {e}")))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        *last_written = stored.snapshot.generation;
        Ok(())
    }

    /// Read and checksum-verify the persisted snapshot. Corrupt or
    /// tampered files are rejected.
    pub async fn read(&self) -> Result<StoredSnapshot> {
        let content = tokio::fs::read_to_string(&self.path).await?;

        let stored: StoredSnapshot = serde_json::from_str(&content).map_err(|e| {
            StatusError::Internal(format!("parsing {}: {e}", self.path.display()))
        })?;

        if !stored.verify() {
            warn!(path = %self.path.display(), "snapshot file checksum mismatch");
            return Err(StatusError::Internal(format!(
                "checksum verification failed for {}",
                self.path.display()
            )));
        }

        Ok(stored)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
