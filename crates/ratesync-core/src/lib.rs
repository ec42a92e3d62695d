//! Core domain model for ratesync reconciliation passes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ratesync-core";

/// Last-known remote version tokens keyed by property id.
///
/// Absence of a key means the property has never completed a sync.
pub type SyncState = BTreeMap<String, String>;

/// Why reconciliation selected a property for this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkReason {
    /// No marker stored for the property.
    New,
    /// Stored marker differs from (or is missing in) the portal catalog.
    Stale,
}

/// A property selected for fetching, carrying the catalog version observed
/// at reconciliation time. `remote_version` is `None` when the catalog had
/// no entry for the property; such items are still fetched, but a pass can
/// never advance their marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub property_id: String,
    pub reason: WorkReason,
    pub remote_version: Option<String>,
}

/// Terminal outcome of one property's fetch after the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    FailedAfterRetry,
}

/// One per [`WorkItem`]: the claimed raw file on success, nothing on failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub item: WorkItem,
    pub raw_file: Option<PathBuf>,
    pub outcome: FetchOutcome,
}

impl FetchResult {
    pub fn succeeded(item: WorkItem, raw_file: PathBuf) -> Self {
        Self {
            item,
            raw_file: Some(raw_file),
            outcome: FetchOutcome::Success,
        }
    }

    pub fn failed(item: WorkItem) -> Self {
        Self {
            item,
            raw_file: None,
            outcome: FetchOutcome::FailedAfterRetry,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == FetchOutcome::Success
    }
}

/// Warehouse-shaped output of one property's transform.
///
/// `columns` holds the normalized data headers and every row aligns with
/// them; the provenance stamp (`property_id`, `source_filename`,
/// `fetched_at`, plus the implicit current flag) applies to all rows of the
/// generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSet {
    pub property_id: String,
    pub source_filename: String,
    pub fetched_at: DateTime<Utc>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RecordSet {
    pub fn record_count(&self) -> u64 {
        self.rows.len() as u64
    }
}

/// One audit row per property per pass, fetched or not. Null filename and
/// timestamp signal a property that produced no loadable file this pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub property_id: String,
    pub record_count: u64,
    pub source_filename: Option<String>,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn loaded(records: &RecordSet, created_at: DateTime<Utc>) -> Self {
        Self {
            property_id: records.property_id.clone(),
            record_count: records.record_count(),
            source_filename: Some(records.source_filename.clone()),
            source_timestamp: Some(records.fetched_at),
            created_at,
        }
    }

    pub fn skipped(property_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            property_id: property_id.to_string(),
            record_count: 0,
            source_filename: None,
            source_timestamp: None,
            created_at,
        }
    }
}

/// How a pass ended. `NothingToDo` is a clean no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PassOutcome {
    NothingToDo,
    Completed,
}

/// Roll-up of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassSummary {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub evaluated: usize,
    pub fetched: usize,
    pub loaded: usize,
    pub failed: usize,
    pub outcome: PassOutcome,
}
