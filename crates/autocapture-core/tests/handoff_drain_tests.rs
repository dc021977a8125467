//! Handoff ingest and spool drain against real directories.

use std::fs;
use std::path::{Path, PathBuf};

use autocapture_core::config::HandoffMode;
use autocapture_core::handoff::{
    DrainOptions, HandoffError, HandoffOptions, REAP_MARKER_FILE, drain_spool, ingest_handoff_dir,
    read_reap_marker,
};
use autocapture_core::record::{HANDOFF_COMPLETED, RETENTION_ELIGIBLE, STAGE1_COMPLETE};
use autocapture_core::store::{RecordStore, open_overlay};
use serde_json::json;
use tempfile::TempDir;

const BLOB: &str = "media/frames/2026/03/01/F1.png";

struct Fixture {
    _dir: TempDir,
    spool: PathBuf,
    handoff: PathBuf,
    data_root: PathBuf,
}

fn write_remote(handoff: &Path, with_blob: bool) {
    let store = autocapture_core::store::SqliteStore::open(&handoff.join("metadata.db")).unwrap();
    store
        .put(
            "run1/evidence.capture.frame/F1",
            &json!({
                "record_type": "evidence.capture.frame",
                "run_id": "run1",
                "ts_utc": "2026-03-01T10:00:00Z",
                "content_hash": "abc",
                "blob_path": BLOB,
                "width": 800,
                "height": 600,
                "uia_ref": {"record_id": "run1/evidence.uia.snapshot/U1", "content_hash": "h1"},
                "input_ref": {"record_id": "run1/evidence.input.batch/I1"},
            }),
        )
        .unwrap();
    store
        .put(
            "run1/evidence.uia.snapshot/U1",
            &json!({
                "record_type": "evidence.uia.snapshot",
                "run_id": "run1",
                "ts_utc": "2026-03-01T10:00:00Z",
                "content_hash": "h1",
                "focus_path": [{"role": "window", "name": "Mail"}],
                "context_peers": [{"role": "list", "name": "Inbox"}],
                "operable": [{"role": "button", "name": "Send"}],
            }),
        )
        .unwrap();
    if with_blob {
        let blob = handoff.join(BLOB);
        fs::create_dir_all(blob.parent().unwrap()).unwrap();
        fs::write(blob, b"\x89PNG fake").unwrap();
    }
}

fn fixture(with_blob: bool) -> Fixture {
    let dir = TempDir::new().unwrap();
    let spool = dir.path().join("spool");
    let handoff = spool.join("host-a-20260301");
    let data_root = dir.path().join("data");
    fs::create_dir_all(&handoff).unwrap();
    fs::create_dir_all(&data_root).unwrap();
    write_remote(&handoff, with_blob);
    Fixture {
        _dir: dir,
        spool,
        handoff,
        data_root,
    }
}

fn options(data_root: &Path) -> HandoffOptions {
    HandoffOptions {
        derived_db: Some(data_root.join("derived").join("stage1_derived.db")),
        ..HandoffOptions::default()
    }
}

fn marker_counts(data_root: &Path) -> (usize, usize) {
    let store = open_overlay(
        &data_root.join("metadata.db"),
        Some(&data_root.join("derived").join("stage1_derived.db")),
    )
    .unwrap();
    (
        store.count_by_type(STAGE1_COMPLETE).unwrap(),
        store.count_by_type(RETENTION_ELIGIBLE).unwrap(),
    )
}

#[test]
fn draining_twice_skips_the_completed_directory() {
    let fx = fixture(true);
    let drain = DrainOptions {
        handoff: options(&fx.data_root),
        ..DrainOptions::default()
    };

    let first = drain_spool(&fx.spool, &fx.data_root, &drain).unwrap();
    assert_eq!(first.processed, 1, "{:?}", first.errors);
    assert_eq!(first.failed, 0);
    let ingested = &first.results[0];
    assert_eq!(ingested.rows_inserted, 2);
    assert_eq!(ingested.media_copied, 1);
    assert_eq!(ingested.pipeline.stage1_marked, 1);
    assert_eq!(ingested.pipeline.retention_marked, 1);
    assert_eq!(ingested.pipeline.queryable, 1);
    assert!(fx.data_root.join(BLOB).is_file());
    assert!(fx.handoff.join(REAP_MARKER_FILE).is_file());
    let counts_after_first = marker_counts(&fx.data_root);
    assert_eq!(counts_after_first, (1, 1));

    let second = drain_spool(&fx.spool, &fx.data_root, &drain).unwrap();
    assert_eq!(second.processed, 0);
    assert!(second.skipped_marked >= 1);
    assert_eq!(marker_counts(&fx.data_root), counts_after_first);
}

#[test]
fn include_marked_reingests_idempotently() {
    let fx = fixture(true);
    let opts = options(&fx.data_root);
    let first = ingest_handoff_dir(&fx.handoff, &fx.data_root, &opts).unwrap();
    let again = ingest_handoff_dir(&fx.handoff, &fx.data_root, &opts).unwrap();
    assert_eq!(again.rows_inserted, 0);
    assert_eq!(again.rows_ignored, 2);
    assert_eq!(again.media_present, 1);
    assert_eq!(again.completion_record_id, first.completion_record_id);

    let store = open_overlay(&fx.data_root.join("metadata.db"), opts.derived_db.as_deref()).unwrap();
    assert_eq!(store.count_by_type(HANDOFF_COMPLETED).unwrap(), 1);
    assert_eq!(marker_counts(&fx.data_root), (1, 1));
}

#[test]
fn strict_mode_aborts_before_writing() {
    let fx = fixture(false);
    let err = ingest_handoff_dir(&fx.handoff, &fx.data_root, &options(&fx.data_root)).unwrap_err();
    match err {
        HandoffError::MissingMedia { count, sample } => {
            assert_eq!(count, 1);
            assert_eq!(sample, vec![BLOB.to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!fx.data_root.join("metadata.db").exists());
    assert!(read_reap_marker(&fx.handoff).is_none());
}

#[test]
fn lenient_mode_records_missing_media() {
    let fx = fixture(false);
    let opts = HandoffOptions {
        strict: false,
        mode: HandoffMode::Hardlink,
        ..options(&fx.data_root)
    };
    let result = ingest_handoff_dir(&fx.handoff, &fx.data_root, &opts).unwrap();
    assert_eq!(result.media_missing, vec![BLOB.to_string()]);
    assert_eq!(result.rows_inserted, 2);
    let marker = read_reap_marker(&fx.handoff).unwrap();
    assert_eq!(marker.counts.media_missing, 1);
}

#[test]
fn failing_directory_does_not_stop_the_drain() {
    let fx = fixture(true);
    let broken = fx.spool.join("host-b-20260301");
    fs::create_dir_all(&broken).unwrap();
    fs::write(broken.join("metadata.db"), b"not a sqlite database").unwrap();
    let drain = DrainOptions {
        handoff: options(&fx.data_root),
        ..DrainOptions::default()
    };
    let result = drain_spool(&fx.spool, &fx.data_root, &drain).unwrap();
    assert_eq!(result.processed, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors.len(), 1);
}
