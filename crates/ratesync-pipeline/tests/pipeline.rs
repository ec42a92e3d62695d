//! End-to-end passes against a replay portal and the in-memory warehouse.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ratesync_core::{PassOutcome, SyncState};
use ratesync_pipeline::{MemoryWarehouse, SyncConfig, SyncPipeline};
use ratesync_portal::ReplayPortal;
use ratesync_storage::StateStore;

const PAYLOAD_A: &str = "Occupancy Pct|Avg Rate\n88|142.50\n91|150.25\n";
const PAYLOAD_B: &str = "Occupancy Pct|Avg Rate\n70|99.00\n";

fn write_payload(root: &Path, name: &str, body: &str) {
    let dir = root.join("payloads");
    std::fs::create_dir_all(&dir).expect("payload dir");
    std::fs::write(dir.join(name), body).expect("payload");
}

fn write_manifest(root: &Path, manifest: &str) {
    std::fs::write(root.join("portal.yaml"), manifest).expect("manifest");
}

/// Short timing knobs so failure paths exhaust their attempts quickly.
fn quick_config(root: &Path) -> SyncConfig {
    SyncConfig {
        workers: 3,
        staging_dir: PathBuf::new(),
        raw_intake_dir: PathBuf::new(),
        processed_dir: PathBuf::new(),
        archive_dir: PathBuf::new(),
        state_path: PathBuf::new(),
        portal_manifest: root.join("portal.yaml"),
        settle_delay: Duration::from_millis(2),
        poll_interval: Duration::from_millis(5),
        poll_timeout: Duration::from_millis(100),
        max_attempts: 2,
        backoff_base: Duration::from_millis(2),
    }
    .with_data_root(root.join("data"))
}

async fn mk_pipeline(root: &Path, warehouse: Arc<MemoryWarehouse>) -> SyncPipeline {
    let config = quick_config(root);
    let portal = Arc::new(
        ReplayPortal::load(root.join("portal.yaml"), config.staging_dir.clone())
            .await
            .expect("load portal"),
    );
    SyncPipeline::new(config, portal.clone(), portal, warehouse)
}

async fn read_state(root: &Path) -> SyncState {
    StateStore::new(root.join("data").join("state").join("sync_state.json"))
        .load()
        .await
        .expect("read state")
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.count())
        .unwrap_or(0)
}

fn sole_dated_archive_dir(root: &Path) -> PathBuf {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root.join("data").join("archive"))
        .expect("archive dir")
        .map(|e| e.expect("entry").path())
        .collect();
    assert_eq!(dirs.len(), 1, "one dated archive directory");
    dirs.remove(0)
}

#[tokio::test]
async fn first_pass_loads_new_properties_end_to_end() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    write_payload(root, "A100_rate_report_08152026_10-30-00.csv", PAYLOAD_A);
    write_payload(root, "B200_rate_report_08142026_09-00-00.csv", PAYLOAD_B);
    write_manifest(
        root,
        r#"
properties:
  - property_id: A100
    version: "08/15/2026 10:30"
    payload: payloads/A100_rate_report_08152026_10-30-00.csv
  - property_id: B200
    version: "08/14/2026 09:00"
    payload: payloads/B200_rate_report_08142026_09-00-00.csv
"#,
    );

    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = mk_pipeline(root, warehouse.clone()).await;
    let summary = pipeline.run_once().await.expect("pass");

    assert_eq!(summary.outcome, PassOutcome::Completed);
    assert_eq!(summary.evaluated, 2);
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.loaded, 2);
    assert_eq!(summary.failed, 0);

    assert_eq!(warehouse.current_rows("A100").await.len(), 2);
    assert_eq!(warehouse.current_rows("B200").await.len(), 1);
    let row = &warehouse.current_rows("B200").await[0];
    assert_eq!(row.values, vec!["70", "99.00"]);
    assert_eq!(
        row.source_filename,
        "B200_rate_report_08142026_09-00-00.csv"
    );

    let audits = warehouse.audits().await;
    assert_eq!(audits.len(), 2, "one audit row per work item");
    assert!(audits
        .iter()
        .all(|a| a.record_count > 0 && a.source_filename.is_some()));

    let state = read_state(root).await;
    assert_eq!(state.get("A100").map(String::as_str), Some("08/15/2026 10:30"));
    assert_eq!(state.get("B200").map(String::as_str), Some("08/14/2026 09:00"));

    // Loaded files move into the dated archive and the working areas drain.
    assert_eq!(count_files(&root.join("data").join("staging")), 0);
    assert_eq!(count_files(&root.join("data").join("raw")), 0);
    assert_eq!(count_files(&root.join("data").join("processed")), 0);
    let dated = sole_dated_archive_dir(root);
    assert_eq!(count_files(&dated.join("raw")), 2);
    assert_eq!(count_files(&dated.join("processed")), 2);
    let manifests: Vec<_> = std::fs::read_dir(&dated)
        .expect("dated dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("manifest_"))
        .collect();
    assert_eq!(manifests.len(), 1);
}

#[tokio::test]
async fn second_pass_with_unchanged_versions_does_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    write_payload(root, "A100_rate_report_08152026_10-30-00.csv", PAYLOAD_A);
    write_manifest(
        root,
        r#"
properties:
  - property_id: A100
    version: "08/15/2026 10:30"
    payload: payloads/A100_rate_report_08152026_10-30-00.csv
"#,
    );

    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = mk_pipeline(root, warehouse.clone()).await;
    pipeline.run_once().await.expect("first pass");
    let rows_after_first = warehouse.rows().await.len();

    let summary = pipeline.run_once().await.expect("second pass");
    assert_eq!(summary.outcome, PassOutcome::NothingToDo);
    assert_eq!(summary.evaluated, 0);
    assert_eq!(summary.loaded, 0);

    assert_eq!(warehouse.rows().await.len(), rows_after_first);
    assert_eq!(warehouse.audits().await.len(), 1, "no new audit rows");
    assert_eq!(read_state(root).await.len(), 1);
}

#[tokio::test]
async fn property_that_never_lands_is_audited_and_skipped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    write_payload(root, "A100_rate_report_08152026_10-30-00.csv", PAYLOAD_A);
    write_manifest(
        root,
        r#"
properties:
  - property_id: A100
    version: "08/15/2026 10:30"
    payload: payloads/A100_rate_report_08152026_10-30-00.csv
  - property_id: C300
    version: "08/10/2026 08:00"
"#,
    );

    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = mk_pipeline(root, warehouse.clone()).await;
    let summary = pipeline.run_once().await.expect("pass completes anyway");

    assert_eq!(summary.outcome, PassOutcome::Completed);
    assert_eq!(summary.evaluated, 2);
    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.loaded, 1);
    assert_eq!(summary.failed, 1);

    let audits = warehouse.audits().await;
    assert_eq!(audits.len(), 2);
    let failed = audits
        .iter()
        .find(|a| a.property_id == "C300")
        .expect("failed property still audited");
    assert_eq!(failed.record_count, 0);
    assert!(failed.source_filename.is_none());
    assert!(failed.source_timestamp.is_none());

    let state = read_state(root).await;
    assert!(state.contains_key("A100"));
    assert!(!state.contains_key("C300"), "failed property keeps no marker");
}

#[tokio::test]
async fn append_failure_leaves_marker_and_local_files_alone() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    write_payload(root, "A100_rate_report_08152026_10-30-00.csv", PAYLOAD_A);
    write_payload(root, "B200_rate_report_08142026_09-00-00.csv", PAYLOAD_B);
    write_manifest(
        root,
        r#"
properties:
  - property_id: A100
    version: "08/15/2026 10:30"
    payload: payloads/A100_rate_report_08152026_10-30-00.csv
  - property_id: B200
    version: "08/14/2026 09:00"
    payload: payloads/B200_rate_report_08142026_09-00-00.csv
"#,
    );

    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse.fail_appends_for("A100").await;
    let pipeline = mk_pipeline(root, warehouse.clone()).await;
    let summary = pipeline.run_once().await.expect("pass");

    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.loaded, 1);
    assert_eq!(summary.failed, 1);

    let state = read_state(root).await;
    assert!(!state.contains_key("A100"), "unconfirmed load advances nothing");
    assert!(state.contains_key("B200"));

    let failed = warehouse
        .audits()
        .await
        .into_iter()
        .find(|a| a.property_id == "A100")
        .expect("audited");
    assert_eq!(failed.record_count, 0);
    assert!(failed.source_filename.is_none());

    // A100's files stay local for inspection; only B200's were archived.
    assert_eq!(count_files(&root.join("data").join("raw")), 1);
    assert_eq!(count_files(&root.join("data").join("processed")), 1);
    let dated = sole_dated_archive_dir(root);
    assert_eq!(count_files(&dated.join("raw")), 1);
}

#[tokio::test]
async fn stale_property_is_refetched_and_supersedes_old_generation() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    write_payload(root, "A100_rate_report_08152026_10-30-00.csv", PAYLOAD_A);
    write_manifest(
        root,
        r#"
properties:
  - property_id: A100
    version: "08/15/2026 10:30"
    payload: payloads/A100_rate_report_08152026_10-30-00.csv
"#,
    );

    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = mk_pipeline(root, warehouse.clone()).await;
    pipeline.run_once().await.expect("first pass");

    // The portal publishes a fresher report for the same property.
    write_payload(root, "A100_rate_report_08162026_11-00-00.csv", PAYLOAD_A);
    write_manifest(
        root,
        r#"
properties:
  - property_id: A100
    version: "08/16/2026 11:00"
    payload: payloads/A100_rate_report_08162026_11-00-00.csv
"#,
    );
    let pipeline = mk_pipeline(root, warehouse.clone()).await;
    let summary = pipeline.run_once().await.expect("second pass");

    assert_eq!(summary.evaluated, 1);
    assert_eq!(summary.loaded, 1);

    let rows = warehouse.rows().await;
    assert_eq!(rows.len(), 4, "both generations retained");
    let current = warehouse.current_rows("A100").await;
    assert_eq!(current.len(), 2, "exactly one generation is current");
    assert!(current
        .iter()
        .all(|r| r.source_filename == "A100_rate_report_08162026_11-00-00.csv"));

    let state = read_state(root).await;
    assert_eq!(state.get("A100").map(String::as_str), Some("08/16/2026 11:00"));
}

#[tokio::test]
async fn versionless_listing_is_loaded_but_marker_never_advances() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    write_payload(root, "C300_rate_report_08152026_10-30-00.csv", PAYLOAD_A);
    write_manifest(
        root,
        r#"
properties:
  - property_id: C300
    payload: payloads/C300_rate_report_08152026_10-30-00.csv
"#,
    );

    let seeded = StateStore::new(root.join("data").join("state").join("sync_state.json"));
    let mut state = SyncState::new();
    state.insert("C300".to_string(), "08/01/2026 08:00".to_string());
    seeded.save(&state).await.expect("seed state");

    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = mk_pipeline(root, warehouse.clone()).await;
    let summary = pipeline.run_once().await.expect("pass");

    assert_eq!(summary.evaluated, 1, "catalog silence still schedules a fetch");
    assert_eq!(summary.loaded, 1);
    assert_eq!(warehouse.current_rows("C300").await.len(), 2);

    let state = read_state(root).await;
    assert_eq!(
        state.get("C300").map(String::as_str),
        Some("08/01/2026 08:00"),
        "marker stays put without a catalog version"
    );
}

#[tokio::test]
async fn foreign_export_fails_the_integrity_check_and_is_not_loaded() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    // The landed filename carries the property code as a substring but its
    // leading token does not match, so the transform must refuse it.
    write_payload(root, "XC300_rate_report_08152026_10-30-00.csv", PAYLOAD_A);
    write_manifest(
        root,
        r#"
properties:
  - property_id: C300
    version: "08/15/2026 10:30"
    payload: payloads/XC300_rate_report_08152026_10-30-00.csv
"#,
    );

    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = mk_pipeline(root, warehouse.clone()).await;
    let summary = pipeline.run_once().await.expect("pass");

    assert_eq!(summary.fetched, 1, "the file did land and was claimed");
    assert_eq!(summary.loaded, 0);
    assert_eq!(summary.failed, 1);

    assert!(warehouse.rows().await.is_empty());
    let audits = warehouse.audits().await;
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].record_count, 0);
    assert!(read_state(root).await.is_empty(), "marker never advances");
}
