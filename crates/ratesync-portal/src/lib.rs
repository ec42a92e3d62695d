//! Remote-portal contracts and the replay fixture implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ratesync_storage::IN_PROGRESS_SUFFIX;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ratesync-portal";

#[derive(Debug, Error)]
pub enum PortalError {
    /// Transient session/UI failure; the fetch sequence retries these.
    #[error("session: {0}")]
    Session(String),
    /// Directory or catalog query failure. Probing runs before anything is
    /// mutated, so these abort the pass.
    #[error("probe: {0}")]
    Probe(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One worker's interactive handle on the portal. Each acquisition worker
/// owns exactly one session; sessions are never shared.
#[async_trait]
pub trait PortalSession: Send {
    /// Direct the session to the property's reporting context.
    async fn select_property(&mut self, property_id: &str) -> Result<(), PortalError>;

    /// Start the export for the selected property. The file lands in the
    /// staging area asynchronously; callers poll for it.
    async fn trigger_export(&mut self) -> Result<(), PortalError>;
}

/// Mints one session per acquisition worker.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PortalSession>, PortalError>;
}

/// Read-only view of what the portal currently lists.
#[async_trait]
pub trait DirectoryProbe: Send + Sync {
    async fn list_properties(&self) -> Result<Vec<String>, PortalError>;

    /// Current version token per property. Ids absent from the returned map
    /// are fetched defensively and never advance their marker.
    async fn version_catalog(
        &self,
        property_ids: &[String],
    ) -> Result<HashMap<String, String>, PortalError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayManifest {
    pub properties: Vec<ReplayProperty>,
}

/// One property the replay portal can serve. `version: None` simulates a
/// listing the catalog query cannot answer for; `payload: None` simulates
/// an export that never lands.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayProperty {
    pub property_id: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Raw file to serve, relative to the manifest's directory.
    #[serde(default)]
    pub payload: Option<String>,
    /// Stage the download under an in-progress suffix first, finalizing
    /// after this many milliseconds.
    #[serde(default)]
    pub in_progress_ms: Option<u64>,
}

/// Fixture-backed portal for demos and integration tests: exports are
/// copies of local payload files dropped into the staging directory.
///
/// The real portal is browser-driven and lives outside this repo; this is
/// the only in-tree implementation of the portal traits.
#[derive(Debug, Clone)]
pub struct ReplayPortal {
    inner: Arc<ReplayInner>,
}

#[derive(Debug)]
struct ReplayInner {
    manifest_dir: PathBuf,
    staging_dir: PathBuf,
    manifest: ReplayManifest,
}

impl ReplayPortal {
    pub async fn load(
        manifest_path: impl AsRef<Path>,
        staging_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let manifest_path = manifest_path.as_ref();
        let text = fs::read_to_string(manifest_path)
            .await
            .with_context(|| format!("reading {}", manifest_path.display()))?;
        let manifest: ReplayManifest = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", manifest_path.display()))?;
        let manifest_dir = manifest_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        Ok(Self {
            inner: Arc::new(ReplayInner {
                manifest_dir,
                staging_dir: staging_dir.into(),
                manifest,
            }),
        })
    }

    pub fn property_count(&self) -> usize {
        self.inner.manifest.properties.len()
    }
}

#[async_trait]
impl DirectoryProbe for ReplayPortal {
    async fn list_properties(&self) -> Result<Vec<String>, PortalError> {
        Ok(self
            .inner
            .manifest
            .properties
            .iter()
            .map(|p| p.property_id.clone())
            .collect())
    }

    async fn version_catalog(
        &self,
        property_ids: &[String],
    ) -> Result<HashMap<String, String>, PortalError> {
        let mut catalog = HashMap::new();
        for id in property_ids {
            let entry = self
                .inner
                .manifest
                .properties
                .iter()
                .find(|p| &p.property_id == id);
            if let Some(version) = entry.and_then(|p| p.version.clone()) {
                catalog.insert(id.clone(), version);
            }
        }
        Ok(catalog)
    }
}

#[async_trait]
impl SessionFactory for ReplayPortal {
    async fn connect(&self) -> Result<Box<dyn PortalSession>, PortalError> {
        Ok(Box::new(ReplaySession {
            inner: Arc::clone(&self.inner),
            selected: None,
        }))
    }
}

struct ReplaySession {
    inner: Arc<ReplayInner>,
    selected: Option<ReplayProperty>,
}

#[async_trait]
impl PortalSession for ReplaySession {
    async fn select_property(&mut self, property_id: &str) -> Result<(), PortalError> {
        let entry = self
            .inner
            .manifest
            .properties
            .iter()
            .find(|p| p.property_id == property_id)
            .ok_or_else(|| PortalError::Session(format!("property {property_id} is not listed")))?;
        self.selected = Some(entry.clone());
        Ok(())
    }

    async fn trigger_export(&mut self) -> Result<(), PortalError> {
        let entry = self.selected.clone().ok_or_else(|| {
            PortalError::Session("trigger_export called before select_property".to_string())
        })?;
        let Some(payload) = &entry.payload else {
            debug!(property_id = %entry.property_id, "replay export configured to never land");
            return Ok(());
        };

        let src = self.inner.manifest_dir.join(payload);
        let bytes = fs::read(&src)
            .await
            .with_context(|| format!("reading replay payload {}", src.display()))?;
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                PortalError::Session(format!("payload path {} has no file name", src.display()))
            })?;

        fs::create_dir_all(&self.inner.staging_dir)
            .await
            .with_context(|| format!("creating {}", self.inner.staging_dir.display()))?;

        let final_path = self.inner.staging_dir.join(&name);
        match entry.in_progress_ms {
            Some(ms) if ms > 0 => {
                let partial_path = self
                    .inner
                    .staging_dir
                    .join(format!("{name}{IN_PROGRESS_SUFFIX}"));
                fs::write(&partial_path, &bytes)
                    .await
                    .with_context(|| format!("writing {}", partial_path.display()))?;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    if let Err(err) = fs::rename(&partial_path, &final_path).await {
                        warn!(error = %err, "replay export finalize failed");
                    }
                });
            }
            _ => {
                fs::write(&final_path, &bytes)
                    .await
                    .with_context(|| format!("writing {}", final_path.display()))?;
            }
        }
        debug!(property_id = %entry.property_id, file = %name, "replay export staged");
        Ok(())
    }
}
