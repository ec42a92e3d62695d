//! Reconciliation-pass orchestration: probe, reconcile, acquire, transform,
//! load, commit.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDateTime, Utc};
use parquet::arrow::ArrowWriter;
use ratesync_core::{
    AuditRecord, FetchResult, PassOutcome, PassSummary, RecordSet, SyncState, WorkItem, WorkReason,
};
use ratesync_portal::{DirectoryProbe, PortalError, PortalSession, ReplayPortal, SessionFactory};
use ratesync_storage::{
    ArchiveManifest, ArchiveStore, BackoffPolicy, StagingArea, StagingScan, StateStore, StoreError,
};
use regex::Regex;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ratesync-pipeline";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workers: usize,
    pub staging_dir: PathBuf,
    pub raw_intake_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub state_path: PathBuf,
    pub portal_manifest: PathBuf,
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub max_attempts: usize,
    pub backoff_base: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("RATESYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        Self {
            workers: env_usize("RATESYNC_WORKERS", 3),
            staging_dir: env_path("RATESYNC_STAGING_DIR", data_dir.join("staging")),
            raw_intake_dir: env_path("RATESYNC_RAW_DIR", data_dir.join("raw")),
            processed_dir: env_path("RATESYNC_PROCESSED_DIR", data_dir.join("processed")),
            archive_dir: env_path("RATESYNC_ARCHIVE_DIR", data_dir.join("archive")),
            state_path: env_path(
                "RATESYNC_STATE_PATH",
                data_dir.join("state").join("sync_state.json"),
            ),
            portal_manifest: env_path(
                "RATESYNC_PORTAL_MANIFEST",
                PathBuf::from("./config/portal.yaml"),
            ),
            settle_delay: Duration::from_secs(env_u64("RATESYNC_SETTLE_SECS", 2)),
            poll_interval: Duration::from_secs(env_u64("RATESYNC_POLL_INTERVAL_SECS", 1)),
            poll_timeout: Duration::from_secs(env_u64("RATESYNC_POLL_TIMEOUT_SECS", 15)),
            max_attempts: env_usize("RATESYNC_FETCH_ATTEMPTS", 3),
            backoff_base: Duration::from_secs(env_u64("RATESYNC_BACKOFF_BASE_SECS", 2)),
        }
    }

    /// Rebase every data path under `root`, keeping the tuning knobs.
    pub fn with_data_root(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.staging_dir = root.join("staging");
        self.raw_intake_dir = root.join("raw");
        self.processed_dir = root.join("processed");
        self.archive_dir = root.join("archive");
        self.state_path = root.join("state").join("sync_state.json");
        self
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            settle_delay: self.settle_delay,
            poll_interval: self.poll_interval,
            poll_timeout: self.poll_timeout,
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts.max(1),
                base_delay: self.backoff_base,
                ..BackoffPolicy::default()
            },
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Timing and retry knobs for one acquisition worker.
#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("invalidate failed: {0}")]
    Invalidate(String),
    #[error("append failed for {property_id}: {reason}")]
    Append { property_id: String, reason: String },
    #[error("audit append failed: {0}")]
    Audit(String),
}

/// Bulk-load surface of the analytical warehouse. At-least-once appends are
/// tolerated because invalidation always precedes the append of a new
/// generation.
#[async_trait::async_trait]
pub trait Warehouse: Send + Sync {
    /// Clear the current flag on every listed property's records.
    async fn invalidate_current(&self, property_ids: &[String]) -> Result<(), WarehouseError>;

    /// Append one property's new generation, returning the row count.
    async fn append_records(&self, records: &RecordSet) -> Result<u64, WarehouseError>;

    async fn append_audit(&self, audits: &[AuditRecord]) -> Result<(), WarehouseError>;
}

/// A warehouse row as stored by [`MemoryWarehouse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub property_id: String,
    pub is_current: bool,
    pub source_filename: String,
    pub fetched_at: DateTime<Utc>,
    pub values: Vec<String>,
}

/// In-memory warehouse double used by demos and tests. `fail_appends_for`
/// arms a per-property append failure.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    rows: tokio::sync::Mutex<Vec<StoredRecord>>,
    audits: tokio::sync::Mutex<Vec<AuditRecord>>,
    failing_appends: tokio::sync::Mutex<HashSet<String>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_appends_for(&self, property_id: &str) {
        self.failing_appends
            .lock()
            .await
            .insert(property_id.to_string());
    }

    pub async fn rows(&self) -> Vec<StoredRecord> {
        self.rows.lock().await.clone()
    }

    pub async fn current_rows(&self, property_id: &str) -> Vec<StoredRecord> {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|r| r.property_id == property_id && r.is_current)
            .cloned()
            .collect()
    }

    pub async fn audits(&self) -> Vec<AuditRecord> {
        self.audits.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Warehouse for MemoryWarehouse {
    async fn invalidate_current(&self, property_ids: &[String]) -> Result<(), WarehouseError> {
        let wanted: HashSet<&String> = property_ids.iter().collect();
        let mut rows = self.rows.lock().await;
        for row in rows.iter_mut() {
            if wanted.contains(&row.property_id) {
                row.is_current = false;
            }
        }
        Ok(())
    }

    async fn append_records(&self, records: &RecordSet) -> Result<u64, WarehouseError> {
        if self
            .failing_appends
            .lock()
            .await
            .contains(&records.property_id)
        {
            return Err(WarehouseError::Append {
                property_id: records.property_id.clone(),
                reason: "armed to fail".to_string(),
            });
        }
        let mut rows = self.rows.lock().await;
        for values in &records.rows {
            rows.push(StoredRecord {
                property_id: records.property_id.clone(),
                is_current: true,
                source_filename: records.source_filename.clone(),
                fetched_at: records.fetched_at,
                values: values.clone(),
            });
        }
        Ok(records.record_count())
    }

    async fn append_audit(&self, audits: &[AuditRecord]) -> Result<(), WarehouseError> {
        self.audits.lock().await.extend_from_slice(audits);
        Ok(())
    }
}

/// Diff the portal listing against stored markers. Properties without a
/// marker come back NEW; marker/catalog mismatches come back STALE; a
/// listed property the catalog cannot answer for is fetched defensively
/// with no version token. Properties that vanished from the listing are
/// left alone.
pub fn reconcile(
    remote: &[String],
    catalog: &HashMap<String, String>,
    state: &SyncState,
) -> Vec<WorkItem> {
    let mut seen = HashSet::new();
    let mut work = Vec::new();
    for property_id in remote {
        if !seen.insert(property_id.as_str()) {
            continue;
        }
        let remote_version = catalog.get(property_id).cloned();
        match state.get(property_id) {
            None => work.push(WorkItem {
                property_id: property_id.clone(),
                reason: WorkReason::New,
                remote_version,
            }),
            Some(marker) => match remote_version {
                Some(version) if &version == marker => {}
                version => work.push(WorkItem {
                    property_id: property_id.clone(),
                    reason: WorkReason::Stale,
                    remote_version: version,
                }),
            },
        }
    }
    work
}

/// Split the work set into exactly `workers` contiguous batches sized
/// `len/workers`, the remainder going one-each to the first `len%workers`
/// batches.
pub fn partition_batches(items: Vec<WorkItem>, workers: usize) -> Vec<Vec<WorkItem>> {
    let workers = workers.max(1);
    let base = items.len() / workers;
    let remainder = items.len() % workers;
    let mut iter = items.into_iter();
    (0..workers)
        .map(|index| {
            let size = base + usize::from(index < remainder);
            iter.by_ref().take(size).collect()
        })
        .collect()
}

/// Fixed input for one acquisition worker.
#[derive(Debug, Clone)]
struct WorkerInput {
    worker_index: usize,
    batch: Vec<WorkItem>,
    staging: StagingArea,
    settings: FetchSettings,
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("session: {0}")]
    Session(#[from] PortalError),
    #[error("export did not finalize within {waited:?}")]
    Timeout { waited: Duration },
    #[error("staging: {0}")]
    Staging(#[from] StoreError),
}

async fn run_worker(sessions: Arc<dyn SessionFactory>, input: WorkerInput) -> Vec<FetchResult> {
    let mut session = match sessions.connect().await {
        Ok(session) => session,
        Err(err) => {
            error!(
                worker = input.worker_index,
                error = %err,
                "portal session unavailable, failing whole batch"
            );
            return input.batch.into_iter().map(FetchResult::failed).collect();
        }
    };

    let mut results = Vec::with_capacity(input.batch.len());
    for item in input.batch {
        let result = fetch_with_retry(
            session.as_mut(),
            &input.staging,
            &item,
            &input.settings,
            input.worker_index,
        )
        .await;
        results.push(result);
    }
    results
}

/// The whole select/trigger/poll sequence, retried with exponential
/// backoff. Exhausted attempts degrade to a recorded failure; nothing
/// escapes the worker.
async fn fetch_with_retry(
    session: &mut dyn PortalSession,
    staging: &StagingArea,
    item: &WorkItem,
    settings: &FetchSettings,
    worker_index: usize,
) -> FetchResult {
    let max_attempts = settings.backoff.max_attempts.max(1);
    for attempt in 0..max_attempts {
        match attempt_fetch(session, staging, item, settings).await {
            Ok(raw_file) => {
                debug!(
                    worker = worker_index,
                    property_id = %item.property_id,
                    attempt = attempt + 1,
                    file = %raw_file.display(),
                    "fetch succeeded"
                );
                return FetchResult::succeeded(item.clone(), raw_file);
            }
            Err(err) => {
                warn!(
                    worker = worker_index,
                    property_id = %item.property_id,
                    attempt = attempt + 1,
                    error = %err,
                    "fetch attempt failed"
                );
                if attempt + 1 < max_attempts {
                    tokio::time::sleep(settings.backoff.delay_for_attempt(attempt)).await;
                }
            }
        }
    }
    warn!(
        worker = worker_index,
        property_id = %item.property_id,
        attempts = max_attempts,
        "giving up on property"
    );
    FetchResult::failed(item.clone())
}

/// One attempt: SELECT, TRIGGER, settle, then poll the staging area until
/// the export finalizes or the poll window closes. A finalized file is
/// claimed into raw-intake in the same step.
async fn attempt_fetch(
    session: &mut dyn PortalSession,
    staging: &StagingArea,
    item: &WorkItem,
    settings: &FetchSettings,
) -> Result<PathBuf, AttemptError> {
    session.select_property(&item.property_id).await?;
    session.trigger_export().await?;
    tokio::time::sleep(settings.settle_delay).await;

    let deadline = tokio::time::Instant::now() + settings.poll_timeout;
    loop {
        match staging.scan_for(&item.property_id).await? {
            StagingScan::Final(path) => {
                let claimed = staging.claim(&path).await?;
                return Ok(claimed);
            }
            StagingScan::InProgress | StagingScan::Missing => {}
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(settings.poll_interval).await;
    }

    // The portal UI can desync from the worker after a dead export; one
    // corrective re-select before the next attempt.
    if let Err(err) = session.select_property(&item.property_id).await {
        debug!(property_id = %item.property_id, error = %err, "corrective re-select failed");
    }
    Err(AttemptError::Timeout {
        waited: settings.poll_timeout,
    })
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("filename {filename} does not carry property {expected}")]
    PropertyMismatch { filename: String, expected: String },
    #[error("no datetime token in filename {filename}")]
    MissingTimestamp { filename: String },
    #[error("bad datetime token {token} in {filename}: {source}")]
    BadTimestamp {
        token: String,
        filename: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("{filename} has no header row")]
    Empty { filename: String },
    #[error("row {row} of {filename} has {found} fields, header has {expected}")]
    RaggedRow {
        filename: String,
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing processed file {path}: {source}")]
    Processed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// One property's transform output, with the files the archive step needs.
#[derive(Debug, Clone)]
pub struct TransformedFile {
    pub records: RecordSet,
    pub raw_path: PathBuf,
    pub processed_path: PathBuf,
}

/// Parse a claimed raw export into a warehouse-shaped record set and
/// persist its normalized Parquet sibling under `processed_dir`.
pub fn transform_raw_file(
    item: &WorkItem,
    raw_path: &Path,
    processed_dir: &Path,
) -> Result<TransformedFile, TransformError> {
    let filename = raw_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let derived = derive_property_id(&filename);
    if derived.as_deref() != Some(item.property_id.as_str()) {
        return Err(TransformError::PropertyMismatch {
            filename,
            expected: item.property_id.clone(),
        });
    }
    let fetched_at = parse_fetched_at(&filename)?;

    let text = std::fs::read_to_string(raw_path).map_err(|source| TransformError::Io {
        path: raw_path.to_path_buf(),
        source,
    })?;
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let header = lines.next().ok_or_else(|| TransformError::Empty {
        filename: filename.clone(),
    })?;
    let columns: Vec<String> = header.split('|').map(normalize_header).collect();

    let mut rows = Vec::new();
    for (index, line) in lines.enumerate() {
        let fields: Vec<String> = line.split('|').map(|f| f.trim().to_string()).collect();
        if fields.len() != columns.len() {
            return Err(TransformError::RaggedRow {
                filename,
                row: index + 2,
                found: fields.len(),
                expected: columns.len(),
            });
        }
        rows.push(fields);
    }

    let records = RecordSet {
        property_id: item.property_id.clone(),
        source_filename: filename.clone(),
        fetched_at,
        columns,
        rows,
    };

    let stem = raw_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| item.property_id.clone());
    let processed_path = processed_dir.join(format!("{stem}_normalized.parquet"));
    write_processed_parquet(&processed_path, &records).map_err(|source| {
        TransformError::Processed {
            path: processed_path.clone(),
            source,
        }
    })?;

    Ok(TransformedFile {
        records,
        raw_path: raw_path.to_path_buf(),
        processed_path,
    })
}

/// Leading filename token, accepted only if it looks like a property code.
fn derive_property_id(filename: &str) -> Option<String> {
    let token = filename.split('_').next()?;
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        Some(token.to_string())
    } else {
        None
    }
}

fn normalize_header(raw: &str) -> String {
    raw.trim().to_uppercase().replace(' ', "_")
}

fn parse_fetched_at(filename: &str) -> Result<DateTime<Utc>, TransformError> {
    let pattern = Regex::new(r"\d{8}_\d{2}-\d{2}-\d{2}").expect("valid datetime regex");
    let token = pattern
        .find(filename)
        .ok_or_else(|| TransformError::MissingTimestamp {
            filename: filename.to_string(),
        })?
        .as_str();
    let naive = NaiveDateTime::parse_from_str(token, "%m%d%Y_%H-%M-%S").map_err(|source| {
        TransformError::BadTimestamp {
            token: token.to_string(),
            filename: filename.to_string(),
            source,
        }
    })?;
    Ok(naive.and_utc())
}

fn write_processed_parquet(path: &Path, records: &RecordSet) -> Result<()> {
    let mut fields = vec![
        ArrowField::new("PROPERTY_ID", DataType::Utf8, false),
        ArrowField::new("IS_CURRENT", DataType::Boolean, false),
        ArrowField::new("SOURCE_FILENAME", DataType::Utf8, false),
        ArrowField::new("FETCHED_AT", DataType::Utf8, false),
    ];
    for column in &records.columns {
        fields.push(ArrowField::new(column, DataType::Utf8, true));
    }
    let schema = Arc::new(Schema::new(fields));

    let row_count = records.rows.len();
    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec![
            Some(records.property_id.as_str());
            row_count
        ])),
        Arc::new(BooleanArray::from(vec![true; row_count])),
        Arc::new(StringArray::from(vec![
            Some(records.source_filename.as_str());
            row_count
        ])),
        Arc::new(StringArray::from(vec![
            Some(records.fetched_at.to_rfc3339());
            row_count
        ])),
    ];
    for index in 0..records.columns.len() {
        let column = records
            .rows
            .iter()
            .map(|row| row.get(index).map(String::as_str))
            .collect::<Vec<_>>();
        arrays.push(Arc::new(StringArray::from(column)));
    }

    let batch =
        RecordBatch::try_new(schema, arrays).context("building processed record batch")?;
    write_parquet(path, batch)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

pub struct SyncPipeline {
    config: SyncConfig,
    state_store: StateStore,
    staging: StagingArea,
    archive: ArchiveStore,
    probe: Arc<dyn DirectoryProbe>,
    sessions: Arc<dyn SessionFactory>,
    warehouse: Arc<dyn Warehouse>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        probe: Arc<dyn DirectoryProbe>,
        sessions: Arc<dyn SessionFactory>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        let state_store = StateStore::new(config.state_path.clone());
        let staging = StagingArea::new(config.staging_dir.clone(), config.raw_intake_dir.clone());
        let archive = ArchiveStore::new(config.archive_dir.clone());
        Self {
            config,
            state_store,
            staging,
            archive,
            probe,
            sessions,
            warehouse,
        }
    }

    /// One full reconciliation pass. Per-property failures are recorded and
    /// never abort the pass; only state-store I/O, an unreachable portal
    /// directory, or a worker panic do.
    pub async fn run_once(&self) -> Result<PassSummary> {
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let pass_id = Uuid::new_v4();

        let state = self.state_store.load().await.context("reading sync state")?;
        let remote = self
            .probe
            .list_properties()
            .await
            .context("listing portal directory")?;
        let catalog = self
            .probe
            .version_catalog(&remote)
            .await
            .context("querying portal version catalog")?;
        let work = reconcile(&remote, &catalog, &state);
        info!(
            pass_id = %pass_id,
            listed = remote.len(),
            markers = state.len(),
            work = work.len(),
            "reconciled portal directory against sync state"
        );

        if work.is_empty() {
            info!(pass_id = %pass_id, "nothing to do");
            return Ok(PassSummary {
                pass_id,
                started_at,
                elapsed: start.elapsed(),
                evaluated: 0,
                fetched: 0,
                loaded: 0,
                failed: 0,
                outcome: PassOutcome::NothingToDo,
            });
        }

        self.staging
            .ensure_layout()
            .await
            .context("preparing staging areas")?;
        fs::create_dir_all(&self.config.processed_dir)
            .await
            .with_context(|| format!("creating {}", self.config.processed_dir.display()))?;

        let results = self.acquire(&work).await?;
        let fetched = results.iter().filter(|r| r.is_success()).count();

        let transformed = self.transform_stage(&results);
        let loaded = self.load_stage(&work, &transformed).await;

        let committed = self.commit_markers(state, &work, &loaded).await?;
        self.archive_and_cleanup(pass_id, &transformed, &loaded)
            .await;

        let summary = PassSummary {
            pass_id,
            started_at,
            elapsed: start.elapsed(),
            evaluated: work.len(),
            fetched,
            loaded: loaded.len(),
            failed: work.len() - loaded.len(),
            outcome: PassOutcome::Completed,
        };
        info!(
            pass_id = %pass_id,
            evaluated = summary.evaluated,
            fetched = summary.fetched,
            loaded = summary.loaded,
            failed = summary.failed,
            committed,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "sync pass finished"
        );
        Ok(summary)
    }

    /// Fan the work set out to one session-owning worker per batch and
    /// block until every worker reports back.
    async fn acquire(&self, work: &[WorkItem]) -> Result<Vec<FetchResult>> {
        let settings = self.config.fetch_settings();
        let mut handles = Vec::new();
        for (worker_index, batch) in partition_batches(work.to_vec(), self.config.workers)
            .into_iter()
            .enumerate()
        {
            if batch.is_empty() {
                continue;
            }
            debug!(worker = worker_index, batch = batch.len(), "spawning acquisition worker");
            let input = WorkerInput {
                worker_index,
                batch,
                staging: self.staging.clone(),
                settings,
            };
            handles.push(tokio::spawn(run_worker(Arc::clone(&self.sessions), input)));
        }

        let mut results = Vec::with_capacity(work.len());
        for handle in handles {
            let mut batch_results = handle.await.context("acquisition worker panicked")?;
            results.append(&mut batch_results);
        }
        Ok(results)
    }

    /// Transform every successful fetch, isolating per-property failures.
    fn transform_stage(&self, results: &[FetchResult]) -> Vec<TransformedFile> {
        let mut transformed = Vec::new();
        for result in results {
            let Some(raw_path) = result.raw_file.as_ref() else {
                continue;
            };
            match transform_raw_file(&result.item, raw_path, &self.config.processed_dir) {
                Ok(file) => {
                    debug!(
                        property_id = %result.item.property_id,
                        records = file.records.record_count(),
                        "transformed raw export"
                    );
                    transformed.push(file);
                }
                Err(err) => warn!(
                    property_id = %result.item.property_id,
                    file = %raw_path.display(),
                    error = %err,
                    "transform failed"
                ),
            }
        }
        transformed
    }

    /// Invalidate-then-append per property, then write the complete audit
    /// ledger for the pass. Returns the properties whose append was
    /// confirmed.
    async fn load_stage(
        &self,
        work: &[WorkItem],
        transformed: &[TransformedFile],
    ) -> HashSet<String> {
        let now = Utc::now();
        let mut loaded = HashSet::new();

        let target_ids: Vec<String> = transformed
            .iter()
            .map(|t| t.records.property_id.clone())
            .collect();
        let mut invalidated = true;
        if !target_ids.is_empty() {
            if let Err(err) = self.warehouse.invalidate_current(&target_ids).await {
                error!(error = %err, "invalidate failed, no appends will be issued this pass");
                invalidated = false;
            }
        }

        if invalidated {
            for file in transformed {
                match self.warehouse.append_records(&file.records).await {
                    Ok(count) => {
                        debug!(
                            property_id = %file.records.property_id,
                            records = count,
                            "appended new current generation"
                        );
                        loaded.insert(file.records.property_id.clone());
                    }
                    Err(err) => warn!(
                        property_id = %file.records.property_id,
                        error = %err,
                        "append failed, marker will not advance"
                    ),
                }
            }
        }

        let audits: Vec<AuditRecord> = work
            .iter()
            .map(|item| {
                transformed
                    .iter()
                    .find(|f| f.records.property_id == item.property_id)
                    .filter(|_| loaded.contains(&item.property_id))
                    .map(|f| AuditRecord::loaded(&f.records, now))
                    .unwrap_or_else(|| AuditRecord::skipped(&item.property_id, now))
            })
            .collect();
        if let Err(err) = self.warehouse.append_audit(&audits).await {
            error!(error = %err, "audit append failed");
        }

        loaded
    }

    /// Advance markers one property at a time, rewriting the store after
    /// each, so a crash mid-commit leaves earlier properties durable and
    /// later ones safely stale.
    async fn commit_markers(
        &self,
        mut state: SyncState,
        work: &[WorkItem],
        loaded: &HashSet<String>,
    ) -> Result<usize> {
        let mut committed = 0usize;
        for item in work {
            if !loaded.contains(&item.property_id) {
                continue;
            }
            let Some(version) = &item.remote_version else {
                warn!(
                    property_id = %item.property_id,
                    "loaded without a catalog version, marker left unchanged"
                );
                continue;
            };
            state.insert(item.property_id.clone(), version.clone());
            self.state_store
                .save(&state)
                .await
                .with_context(|| format!("committing marker for {}", item.property_id))?;
            debug!(property_id = %item.property_id, version = %version, "marker advanced");
            committed += 1;
        }
        Ok(committed)
    }

    /// Copy loaded properties' raw and processed files into the archive,
    /// then remove the local copies. Advisory: failures are logged and the
    /// pass result stands.
    async fn archive_and_cleanup(
        &self,
        pass_id: Uuid,
        transformed: &[TransformedFile],
        loaded: &HashSet<String>,
    ) {
        let raw: Vec<PathBuf> = transformed
            .iter()
            .filter(|f| loaded.contains(&f.records.property_id))
            .map(|f| f.raw_path.clone())
            .collect();
        let processed: Vec<PathBuf> = transformed
            .iter()
            .filter(|f| loaded.contains(&f.records.property_id))
            .map(|f| f.processed_path.clone())
            .collect();
        if raw.is_empty() && processed.is_empty() {
            return;
        }

        let day = Utc::now();
        let mut files = Vec::new();
        let mut cleanup = Vec::new();
        for (kind, paths) in [("raw", &raw), ("processed", &processed)] {
            match self.archive.archive_files(day, kind, paths).await {
                Ok(mut entries) => {
                    files.append(&mut entries);
                    cleanup.extend(paths.iter().cloned());
                }
                Err(err) => warn!(kind, error = %err, "archive copy failed, keeping local files"),
            }
        }

        let manifest = ArchiveManifest {
            schema_version: 1,
            pass_id,
            archived_at: day,
            files,
        };
        if let Err(err) = self.archive.write_manifest(day, &manifest).await {
            warn!(error = %err, "archive manifest write failed");
        }

        for path in cleanup {
            if let Err(err) = fs::remove_file(&path).await {
                warn!(file = %path.display(), error = %err, "cleanup failed");
            }
        }
    }
}

/// Build and run the pipeline the CLI fronts: replay portal plus the
/// in-memory warehouse stand-in.
pub async fn run_sync_once(config: SyncConfig) -> Result<PassSummary> {
    let portal = Arc::new(
        ReplayPortal::load(&config.portal_manifest, config.staging_dir.clone())
            .await
            .context("loading portal manifest")?,
    );
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = SyncPipeline::new(config, portal.clone(), portal, warehouse);
    pipeline.run_once().await
}

pub async fn run_sync_once_from_env() -> Result<PassSummary> {
    run_sync_once(SyncConfig::from_env()).await
}
