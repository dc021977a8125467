//! End-to-end lineage scenarios over a file-backed SQLite store.
//!
//! Each test seeds raw evidence the way a capture host would, then drives the
//! public pipeline, audit, gate and repair entry points.

use autocapture_core::audit::{AuditOptions, audit_store, run_audit};
use autocapture_core::config::UiaObservationConfig;
use autocapture_core::gate;
use autocapture_core::lineage;
use autocapture_core::pipeline::{PipelineContext, process_frame};
use autocapture_core::record::{FrameRecord, Record, RETENTION_ELIGIBLE, STAGE1_COMPLETE};
use autocapture_core::repair;
use autocapture_core::retention;
use autocapture_core::stage1;
use autocapture_core::store::{RecordStore, SqliteStore, open_overlay};
use serde_json::{Value, json};
use tempfile::TempDir;

const F1: &str = "run1/evidence.capture.frame/F1";

// =============================================================================
// Fixtures
// =============================================================================

fn frame_payload(ts: &str) -> Value {
    json!({
        "record_type": "evidence.capture.frame",
        "run_id": "run1",
        "ts_utc": ts,
        "content_hash": "abc",
        "blob_path": "media/frames/F1.png",
        "width": 1280,
        "height": 720,
        "window_title": "Editor",
        "uia_ref": {"record_id": "U1", "content_hash": "h1"},
        "input_ref": {"record_id": "I1"},
    })
}

fn snapshot_payload(populated: bool) -> Value {
    let (focus, peers, operable) = if populated {
        (
            json!([{"eid": "e1", "role": "window", "name": "Editor", "rect": [0.0, 0.0, 1280.0, 720.0]}]),
            json!([{"eid": "e2", "role": "tab", "name": "notes.txt", "rect": [10.0, 10.0, 120.0, 40.0]}]),
            json!([{"eid": "e3", "role": "button", "name": "Save", "rect": [1200.0, 680.0, 1400.0, 760.0]}]),
        )
    } else {
        (json!([]), json!([]), json!([]))
    };
    json!({
        "record_type": "evidence.uia.snapshot",
        "run_id": "run1",
        "ts_utc": "2026-03-01T10:00:01Z",
        "content_hash": "h1",
        "window": {"title": "Editor", "pid": 4242},
        "focus_path": focus,
        "context_peers": peers,
        "operable": operable,
    })
}

fn open_store(dir: &TempDir) -> SqliteStore {
    SqliteStore::open(&dir.path().join("metadata.db")).expect("open metadata.db")
}

fn frame(store: &dyn RecordStore) -> FrameRecord {
    Record::frame(&store.get(F1).unwrap().expect("frame present")).expect("frame decodes")
}

// =============================================================================
// Empty snapshot, then populated
// =============================================================================

#[test]
fn empty_snapshot_defers_retention_until_observations_exist() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.put(F1, &frame_payload("2026-03-01T10:00:00Z")).unwrap();
    store.put("U1", &snapshot_payload(false)).unwrap();
    let config = UiaObservationConfig::default();
    let ctx = PipelineContext {
        store: &store,
        data_root: Some(dir.path()),
        uia: &config,
    };

    let first = process_frame(&ctx, F1, &frame(&store)).unwrap();
    let marker = store.get(&stage1::marker_id(F1)).unwrap().expect("stage1 marker written");
    assert_eq!(marker["complete"], true);
    assert!(first.retention_marker.is_none());
    assert!(store.get(&retention::marker_id(F1)).unwrap().is_none());
    let lineage = lineage::evaluate_frame_id(&store, F1).unwrap().unwrap();
    assert!(!lineage.queryable);
    assert!(lineage.issues.iter().any(|i| i == "obs_focus_missing"));

    store.put("U1", &snapshot_payload(true)).unwrap();
    let second = process_frame(&ctx, F1, &frame(&store)).unwrap();
    assert_eq!(second.uia.inserted, 3);
    let retention = retention::load_marker(&store, F1).unwrap().expect("retention marker written");
    assert_eq!(retention.stage1_contract_validated, Some(true));
    assert_eq!(retention.quarantine_pending, Some(false));
    assert!(second.queryable);

    // A third pass changes nothing.
    let before = store.keys().unwrap().len();
    process_frame(&ctx, F1, &frame(&store)).unwrap();
    assert_eq!(store.keys().unwrap().len(), before);
}

#[test]
fn observation_bboxes_are_clamped_to_frame() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.put(F1, &frame_payload("2026-03-01T10:00:00Z")).unwrap();
    store.put("U1", &snapshot_payload(true)).unwrap();
    let config = UiaObservationConfig::default();
    let ctx = PipelineContext {
        store: &store,
        data_root: None,
        uia: &config,
    };
    process_frame(&ctx, F1, &frame(&store)).unwrap();

    let operable_id = autocapture_core::uia::obs_doc_id(
        F1,
        autocapture_core::record::ObsSection::Operable,
        "U1",
        "h1",
    );
    let doc = store.get(&operable_id).unwrap().expect("operable doc");
    assert_eq!(doc["bboxes"][0], json!([1200, 680, 1280, 720]));
}

// =============================================================================
// Legacy retention marker
// =============================================================================

#[test]
fn legacy_retention_marker_is_not_validated_and_gets_quarantined() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.put(F1, &frame_payload("2026-03-01T10:00:00Z")).unwrap();
    store.put("U1", &snapshot_payload(true)).unwrap();
    store
        .put(
            &retention::marker_id(F1),
            &json!({
                "record_type": RETENTION_ELIGIBLE,
                "source_record_id": F1,
                "eligible": true,
            }),
        )
        .unwrap();

    let lineage = lineage::evaluate_frame_id(&store, F1).unwrap().unwrap();
    assert!(!lineage.retention_ok);
    assert!(!lineage.queryable);
    assert!(lineage.issues.iter().any(|i| i == lineage::ISSUE_RETENTION_NOT_VALIDATED));

    let result = repair::revalidate_markers(&store, false, usize::MAX).unwrap();
    assert_eq!(result.quarantined, 1);
    let marker = retention::load_marker(&store, F1).unwrap().unwrap();
    assert_eq!(marker.quarantine_pending, Some(true));
    assert_eq!(marker.stage1_contract_validated, Some(false));
    assert_eq!(store.count_by_type(STAGE1_COMPLETE).unwrap(), 0);
}

// =============================================================================
// Audit, gate, repair over the overlay layout
// =============================================================================

#[test]
fn offline_repair_lifts_gate_over_split_databases() {
    let dir = TempDir::new().unwrap();
    let metadata = dir.path().join("metadata.db");
    let derived = dir.path().join("derived").join("stage1_derived.db");
    {
        let raw = SqliteStore::open(&metadata).unwrap();
        for (i, ts) in ["2026-03-01T10:00:00Z", "2026-03-01T10:00:30Z", "2026-03-01T10:05:00Z"]
            .iter()
            .enumerate()
        {
            raw.put(&format!("run1/evidence.capture.frame/{i}"), &frame_payload(ts)).unwrap();
        }
        let mut snapshot = snapshot_payload(true);
        snapshot["ts_utc"] = json!("2026-03-01T10:01:00Z");
        raw.put("U1", &snapshot).unwrap();
    }

    let before = run_audit(&metadata, Some(&derived), &AuditOptions::default()).unwrap();
    assert_eq!(before.summary.frames_total, 3);
    assert_eq!(before.summary.frames_queryable, 0);
    assert!(!gate::evaluate(&before.summary, gate::DEFAULT_MIN_QUERYABLE_RATIO).ok);

    let store = open_overlay(&metadata, Some(&derived)).unwrap();
    let config = UiaObservationConfig::default();
    let ctx = PipelineContext {
        store: &store,
        data_root: Some(dir.path()),
        uia: &config,
    };
    let report = repair::repair_queryability(&ctx, gate::DEFAULT_MIN_QUERYABLE_RATIO, false, 100).unwrap();
    assert_eq!(report.after.frames_queryable, 3);
    assert!(report.gate.ok, "{:?}", report.gate.reasons);
    drop(store);

    // Markers live in the derived database only.
    let raw = SqliteStore::open(&metadata).unwrap();
    assert_eq!(raw.count_by_type(STAGE1_COMPLETE).unwrap(), 0);
    let after = run_audit(&metadata, Some(&derived), &AuditOptions::default()).unwrap();
    assert_eq!(after.summary.frames_queryable, 3);
    assert_eq!(after.longest_window_frames, 2);
    assert_eq!(after.windows.len(), 2);
}

#[test]
fn audit_of_in_memory_overlay_matches_file_audit() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.put(F1, &frame_payload("2026-03-01T10:00:00Z")).unwrap();
    let report = audit_store(&store, &AuditOptions::default()).unwrap();
    assert_eq!(report.summary.frames_total, 1);
    assert_eq!(report.frames_with_issues, 1);
    assert_eq!(report.samples.len(), 1);
}
