//! Durable sync-state, staging-area, and archive storage for ratesync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ratesync_core::SyncState;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ratesync-storage";

/// Suffix a download must carry before it can be claimed.
pub const FINAL_SUFFIX: &str = ".csv";
/// Suffix the portal gives a download that is still being written.
pub const IN_PROGRESS_SUFFIX: &str = ".part";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed state file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// File-backed marker store: the whole map is read at pass start and
/// rewritten after each property's commit.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every marker. A store file that does not exist yet is an empty
    /// state; any other failure is surfaced, since a pass must not run
    /// against markers it cannot trust.
    pub async fn load(&self) -> Result<SyncState, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed {
                path: self.path.clone(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SyncState::new()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Rewrite the whole marker map through a temp file and atomic rename,
    /// so a crash mid-save never truncates the store.
    pub async fn save(&self, state: &SyncState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let bytes =
            serde_json::to_vec_pretty(state).map_err(|source| StoreError::Malformed {
                path: self.path.clone(),
                source,
            })?;

        let temp_path = self
            .path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { path, source }
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(&bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: self.path.clone(),
                source,
            });
        }
        debug!(path = %self.path.display(), markers = state.len(), "state store saved");
        Ok(())
    }
}

/// What one staging-directory scan saw for a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingScan {
    /// A finalized download, ready to claim.
    Final(PathBuf),
    /// A matching download still carrying the in-progress suffix.
    InProgress,
    /// No matching file yet.
    Missing,
}

/// The directory downloads land in, plus the raw-intake directory claimed
/// files are moved to so later scans cannot rematch them.
#[derive(Debug, Clone)]
pub struct StagingArea {
    downloads_dir: PathBuf,
    raw_intake_dir: PathBuf,
}

impl StagingArea {
    pub fn new(downloads_dir: impl Into<PathBuf>, raw_intake_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
            raw_intake_dir: raw_intake_dir.into(),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn raw_intake_dir(&self) -> &Path {
        &self.raw_intake_dir
    }

    pub async fn ensure_layout(&self) -> Result<(), StoreError> {
        for dir in [&self.downloads_dir, &self.raw_intake_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|source| StoreError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// One poll step: look for a filename containing the property id. A
    /// downloads directory that does not exist yet scans as empty.
    pub async fn scan_for(&self, property_id: &str) -> Result<StagingScan, StoreError> {
        let mut entries = match fs::read_dir(&self.downloads_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StagingScan::Missing)
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.downloads_dir.clone(),
                    source,
                })
            }
        };

        let mut saw_in_progress = false;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StoreError::Io {
                path: self.downloads_dir.clone(),
                source,
            })?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.contains(property_id) {
                continue;
            }
            if name.ends_with(FINAL_SUFFIX) {
                return Ok(StagingScan::Final(entry.path()));
            }
            if name.ends_with(IN_PROGRESS_SUFFIX) {
                saw_in_progress = true;
            }
        }

        Ok(if saw_in_progress {
            StagingScan::InProgress
        } else {
            StagingScan::Missing
        })
    }

    /// Move a finalized download into raw-intake. Rename, not copy: the
    /// staging entry must disappear in the same step.
    pub async fn claim(&self, path: &Path) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.raw_intake_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.raw_intake_dir.clone(),
                source,
            })?;

        let file_name = path.file_name().ok_or_else(|| StoreError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
        })?;
        let dest = self.raw_intake_dir.join(file_name);
        fs::rename(path, &dest)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(from = %path.display(), to = %dest.display(), "claimed download");
        Ok(dest)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchivedFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveManifest {
    pub schema_version: u32,
    pub pass_id: Uuid,
    pub archived_at: DateTime<Utc>,
    pub files: Vec<ArchivedFile>,
}

/// Write-only copy target for raw and processed files, laid out
/// `<root>/<YYYYMMDD>/<kind>/<name>` with a per-pass manifest.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn day_dir(&self, day: DateTime<Utc>, kind: &str) -> PathBuf {
        self.root
            .join(day.format("%Y%m%d").to_string())
            .join(kind)
    }

    /// Copy each file under the dated `kind` directory and return manifest
    /// entries for what was written.
    pub async fn archive_files(
        &self,
        day: DateTime<Utc>,
        kind: &str,
        paths: &[PathBuf],
    ) -> anyhow::Result<Vec<ArchivedFile>> {
        use anyhow::Context;

        let dir = self.day_dir(day, kind);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .with_context(|| format!("archiving pathless file {}", path.display()))?;
            let dest = dir.join(&name);
            fs::write(&dest, &bytes)
                .await
                .with_context(|| format!("writing {}", dest.display()))?;

            let rel = dest
                .strip_prefix(&self.root)
                .unwrap_or(&dest)
                .display()
                .to_string();
            entries.push(ArchivedFile {
                name,
                sha256: Self::sha256_hex(&bytes),
                bytes: bytes.len() as u64,
                path: rel,
            });
        }
        Ok(entries)
    }

    pub async fn write_manifest(
        &self,
        day: DateTime<Utc>,
        manifest: &ArchiveManifest,
    ) -> anyhow::Result<PathBuf> {
        use anyhow::Context;

        let dir = self.root.join(day.format("%Y%m%d").to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;
        let path = dir.join(format!("manifest_{}.json", manifest.pass_id));
        let bytes =
            serde_json::to_vec_pretty(manifest).context("serializing archive manifest")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

/// Retry pacing for the per-property fetch sequence.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt `attempt_index`
    /// (zero-based): base doubled per retry, capped.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}
