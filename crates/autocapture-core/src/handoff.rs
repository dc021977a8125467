//! Handoff ingest: merge another capture host's `metadata.db` and `media/`
//! tree into the local data root.
//!
//! # Steps
//!
//! 1. Take the instance lock on the destination data root.
//! 2. Read the remote database through the resilient reader.
//! 3. Collect every `blob_path`-shaped reference from the remote rows.
//! 4. In strict mode, abort before writing anything if a referenced blob is
//!    present in neither tree.
//! 5. Place missing blobs (copy, or hard link with copy fallback).
//! 6. Insert-or-ignore every remote row into the destination table.
//! 7. Run the frame pipeline over every remote frame.
//! 8. Write the completion record and, into the *source* directory, the
//!    reap marker.
//!
//! A drain pass skips directories whose reap marker shows no outstanding
//! work, and re-ingests those that still report frames missing a retention
//! marker or UIA observations.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{HandoffMode, UiaObservationConfig};
use crate::error::StoreError;
use crate::hashing::{record_id, sha256_file, sha256_text};
use crate::journal;
use crate::lock::{InstanceLock, LockError};
use crate::media::{self, MediaError, Placement};
use crate::pipeline::{PipelineContext, PipelineCounts, process_frame};
use crate::record::{FRAME, HANDOFF_COMPLETED, Record, format_ts};
use crate::resilient::{ReadError, ReadOptions, open_resilient};
use crate::retry::RetryPolicy;
use crate::store::{RecordStore, open_overlay};

pub const REAP_MARKER_FILE: &str = "reap_eligible.json";
pub const REAP_MARKER_SCHEMA: &str = "autocapture.handoff.reap_eligible.v1";
pub const METADATA_DB_FILE: &str = "metadata.db";

/// Run id used for completion records, which belong to no capture run.
const SYSTEM_RUN_ID: &str = "system";

const MISSING_SAMPLE_LIMIT: usize = 10;

#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("handoff directory has no {METADATA_DB_FILE}: {0}")]
    MissingDatabase(String),

    #[error("{count} referenced media file(s) missing, e.g. {sample:?}")]
    MissingMedia { count: usize, sample: Vec<String> },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl HandoffError {
    /// Errors that would fail every directory of a drain the same way.
    #[must_use]
    pub fn is_fatal_for_drain(&self) -> bool {
        matches!(self, Self::Lock(_))
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> HandoffError + '_ {
    move |source| HandoffError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct HandoffOptions {
    pub mode: HandoffMode,
    pub strict: bool,
    /// Derived marker database; `None` writes markers into `metadata.db`
    pub derived_db: Option<PathBuf>,
    pub uia: UiaObservationConfig,
    pub lock_policy: RetryPolicy,
    pub read: ReadOptions,
}

impl Default for HandoffOptions {
    fn default() -> Self {
        Self {
            mode: HandoffMode::Copy,
            strict: true,
            derived_db: None,
            uia: UiaObservationConfig::default(),
            lock_policy: RetryPolicy::instance_lock(),
            read: ReadOptions::default(),
        }
    }
}

// =============================================================================
// Reap marker
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReapCounts {
    pub rows_total: usize,
    pub rows_inserted: usize,
    pub media_copied: usize,
    pub media_linked: usize,
    pub media_present: usize,
    pub media_missing: usize,
    pub frames: usize,
    pub stage1_complete: usize,
    pub stage1_marked: usize,
    pub retention_marked: usize,
    pub stage1_missing_retention_marker_count: usize,
    pub stage1_uia_frames_missing_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReapMarker {
    pub schema: String,
    pub handoff_hash: String,
    pub ts_utc: String,
    pub counts: ReapCounts,
}

impl ReapMarker {
    /// Whether a drain should ingest the directory again.
    #[must_use]
    pub fn has_outstanding_work(&self) -> bool {
        self.schema != REAP_MARKER_SCHEMA
            || self.counts.stage1_missing_retention_marker_count > 0
            || self.counts.stage1_uia_frames_missing_count > 0
    }
}

/// Read `reap_eligible.json`. Unreadable markers count as absent.
#[must_use]
pub fn read_reap_marker(handoff_dir: &Path) -> Option<ReapMarker> {
    let path = handoff_dir.join(REAP_MARKER_FILE);
    let raw = fs::read(&path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(marker) => Some(marker),
        Err(e) => {
            warn!(marker = %path.display(), error = %e, "Unparseable reap marker");
            None
        }
    }
}

fn write_reap_marker(handoff_dir: &Path, marker: &ReapMarker) -> Result<(), HandoffError> {
    let path = handoff_dir.join(REAP_MARKER_FILE);
    let body = serde_json::to_vec_pretty(marker).map_err(|e| HandoffError::Io {
        path: path.display().to_string(),
        source: io::Error::other(e),
    })?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".reap-")
        .tempfile_in(handoff_dir)
        .map_err(io_err(handoff_dir))?;
    tmp.write_all(&body).map_err(io_err(&path))?;
    tmp.as_file().sync_all().map_err(io_err(&path))?;
    tmp.persist(&path).map_err(|e| HandoffError::Io {
        path: path.display().to_string(),
        source: e.error,
    })?;
    Ok(())
}

// =============================================================================
// Blob references
// =============================================================================

fn is_blob_key(key: &str) -> bool {
    key == "blob_path" || key.ends_with("_blob_path")
}

/// Every blob-path string anywhere in a payload, by key name.
pub fn collect_blob_paths(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match child {
                    Value::String(path) if is_blob_key(key) && !path.trim().is_empty() => {
                        out.insert(path.clone());
                    }
                    _ => collect_blob_paths(child, out),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_blob_paths(item, out);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Default)]
struct MediaPlan {
    to_place: Vec<(PathBuf, PathBuf)>,
    present: usize,
    missing: Vec<String>,
}

fn plan_media(handoff_dir: &Path, data_root: &Path, blob_paths: &BTreeSet<String>) -> MediaPlan {
    let mut plan = MediaPlan::default();
    for raw in blob_paths {
        let Ok(relative) = media::validate_relative_path(raw) else {
            warn!(blob_path = %raw, "Unsafe blob path in handoff");
            plan.missing.push(raw.clone());
            continue;
        };
        let dest = data_root.join(&relative);
        let src = handoff_dir.join(&relative);
        if dest.is_file() {
            plan.present += 1;
        } else if src.is_file() {
            plan.to_place.push((src, dest));
        } else {
            plan.missing.push(raw.clone());
        }
    }
    plan
}

// =============================================================================
// Ingest
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    pub handoff_dir: String,
    pub handoff_hash: String,
    pub completion_record_id: String,
    pub rows_total: usize,
    pub rows_inserted: usize,
    pub rows_ignored: usize,
    pub media_required: usize,
    pub media_copied: usize,
    pub media_linked: usize,
    pub media_present: usize,
    pub media_missing: Vec<String>,
    pub frame_decode_errors: usize,
    pub pipeline: PipelineCounts,
    pub reap_marker_written: bool,
    pub journal_hash: Option<String>,
}

impl IngestResult {
    fn reap_counts(&self) -> ReapCounts {
        ReapCounts {
            rows_total: self.rows_total,
            rows_inserted: self.rows_inserted,
            media_copied: self.media_copied,
            media_linked: self.media_linked,
            media_present: self.media_present,
            media_missing: self.media_missing.len(),
            frames: self.pipeline.frames,
            stage1_complete: self.pipeline.stage1_complete,
            stage1_marked: self.pipeline.stage1_marked,
            retention_marked: self.pipeline.retention_marked,
            stage1_missing_retention_marker_count: self.pipeline.stage1_missing_retention_marker,
            stage1_uia_frames_missing_count: self.pipeline.uia_frames_missing,
        }
    }
}

/// `sha256(<remote db sha256>:<directory name>)`
pub fn handoff_hash(handoff_dir: &Path) -> Result<String, HandoffError> {
    let db = handoff_dir.join(METADATA_DB_FILE);
    let db_sha = sha256_file(&db).map_err(io_err(&db))?;
    let name = handoff_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(sha256_text(&format!("{db_sha}:{name}")))
}

/// Merge one handoff directory into `data_root`.
pub fn ingest_handoff_dir(
    handoff_dir: &Path,
    data_root: &Path,
    options: &HandoffOptions,
) -> Result<IngestResult, HandoffError> {
    let remote_db = handoff_dir.join(METADATA_DB_FILE);
    if !remote_db.is_file() {
        return Err(HandoffError::MissingDatabase(handoff_dir.display().to_string()));
    }
    let _lock = InstanceLock::acquire_with_retry(data_root, &options.lock_policy)?;
    let hash = handoff_hash(handoff_dir)?;

    let remote = open_resilient(&remote_db, &options.read)?;
    let rows = remote.store().rows()?;
    let mut result = IngestResult {
        handoff_dir: handoff_dir.display().to_string(),
        handoff_hash: hash.clone(),
        rows_total: rows.len(),
        ..IngestResult::default()
    };

    let mut payloads = Vec::with_capacity(rows.len());
    let mut blob_paths = BTreeSet::new();
    for row in &rows {
        match serde_json::from_str::<Value>(&row.payload) {
            Ok(payload) => {
                collect_blob_paths(&payload, &mut blob_paths);
                payloads.push(Some(payload));
            }
            Err(e) => {
                warn!(record_id = %row.id, error = %e, "Unparseable remote payload");
                payloads.push(None);
            }
        }
    }
    result.media_required = blob_paths.len();

    let plan = plan_media(handoff_dir, data_root, &blob_paths);
    if !plan.missing.is_empty() {
        if options.strict {
            return Err(HandoffError::MissingMedia {
                count: plan.missing.len(),
                sample: plan.missing.iter().take(MISSING_SAMPLE_LIMIT).cloned().collect(),
            });
        }
        warn!(
            handoff_dir = %handoff_dir.display(),
            missing = plan.missing.len(),
            "Handoff references missing media, continuing (non-strict)"
        );
    }
    result.media_present = plan.present;
    result.media_missing = plan.missing;

    for (src, dest) in &plan.to_place {
        let placement = match options.mode {
            HandoffMode::Copy => {
                media::copy_atomic(src, dest)?;
                Placement::Copied
            }
            HandoffMode::Hardlink => media::link_or_copy(src, dest)?,
        };
        match placement {
            Placement::Copied => result.media_copied += 1,
            Placement::Linked => result.media_linked += 1,
        }
    }

    let store = open_overlay(&data_root.join(METADATA_DB_FILE), options.derived_db.as_deref())?;
    for row in &rows {
        if store.source().insert_raw(row)? {
            result.rows_inserted += 1;
        } else {
            result.rows_ignored += 1;
        }
    }

    let ctx = PipelineContext {
        store: &store,
        data_root: Some(data_root),
        uia: &options.uia,
    };
    for (row, payload) in rows.iter().zip(&payloads) {
        let Some(payload) = payload else { continue };
        if row.record_type.as_deref() != Some(FRAME) {
            continue;
        }
        match Record::frame(payload) {
            Ok(frame) => {
                let outcome = process_frame(&ctx, &row.id, &frame)?;
                result.pipeline.record(&outcome);
            }
            Err(e) => {
                warn!(record_id = %row.id, error = %e, "Remote frame failed to decode");
                result.frame_decode_errors += 1;
            }
        }
    }

    let now = format_ts(Utc::now());
    let counts = result.reap_counts();
    let completion_id = record_id(SYSTEM_RUN_ID, HANDOFF_COMPLETED, &hash);
    let completion = json!({
        "record_type": HANDOFF_COMPLETED,
        "run_id": SYSTEM_RUN_ID,
        "ts_utc": now,
        "handoff_hash": hash,
        "handoff_dir": result.handoff_dir,
        "counts": counts,
    });
    store.insert_if_absent(&completion_id, &completion)?;
    result.completion_record_id = completion_id;
    result.journal_hash = journal::append_best_effort(
        &journal::journal_path(data_root),
        "handoff.completed",
        completion,
        &now,
    );

    let marker = ReapMarker {
        schema: REAP_MARKER_SCHEMA.to_string(),
        handoff_hash: hash,
        ts_utc: now,
        counts,
    };
    match write_reap_marker(handoff_dir, &marker) {
        Ok(()) => result.reap_marker_written = true,
        Err(e) => warn!(handoff_dir = %handoff_dir.display(), error = %e, "Reap marker not written"),
    }

    info!(
        handoff_dir = %handoff_dir.display(),
        rows_inserted = result.rows_inserted,
        frames = result.pipeline.frames,
        media_copied = result.media_copied,
        media_linked = result.media_linked,
        "Handoff ingested"
    );
    Ok(result)
}

// =============================================================================
// Spool drain
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct DrainOptions {
    pub handoff: HandoffOptions,
    /// Re-ingest directories whose marker shows no outstanding work
    pub include_marked: bool,
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainResult {
    pub processed: usize,
    pub skipped_marked: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub results: Vec<IngestResult>,
}

/// Subdirectories of the spool that look like handoffs, sorted.
pub fn handoff_dirs(spool_dir: &Path) -> Result<Vec<PathBuf>, HandoffError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(spool_dir).map_err(io_err(spool_dir))? {
        let path = entry.map_err(io_err(spool_dir))?.path();
        if path.is_dir() && path.join(METADATA_DB_FILE).is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Ingest every pending handoff directory under `spool_dir`.
///
/// A held instance lock aborts the whole drain; other per-directory failures
/// are recorded and, unless `fail_fast`, the drain moves on.
pub fn drain_spool(spool_dir: &Path, data_root: &Path, options: &DrainOptions) -> Result<DrainResult, HandoffError> {
    let mut result = DrainResult::default();
    for dir in handoff_dirs(spool_dir)? {
        if !options.include_marked {
            if let Some(marker) = read_reap_marker(&dir) {
                if !marker.has_outstanding_work() {
                    debug!(handoff_dir = %dir.display(), "Skipping drained handoff");
                    result.skipped_marked += 1;
                    continue;
                }
                info!(handoff_dir = %dir.display(), "Re-draining handoff with outstanding work");
            }
        }
        match ingest_handoff_dir(&dir, data_root, &options.handoff) {
            Ok(ingested) => {
                result.processed += 1;
                result.results.push(ingested);
            }
            Err(e) if e.is_fatal_for_drain() => return Err(e),
            Err(e) => {
                warn!(handoff_dir = %dir.display(), error = %e, "Handoff ingest failed");
                result.failed += 1;
                result.errors.push(format!("{}: {e}", dir.display()));
                if options.fail_fast {
                    break;
                }
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_paths_are_found_recursively() {
        let payload = json!({
            "blob_path": "media/a.png",
            "thumb": {"thumb_blob_path": "media/t.png", "other": "media/x.png"},
            "items": [{"blob_path": "media/b.png"}, {"blob_path": ""}],
        });
        let mut out = BTreeSet::new();
        collect_blob_paths(&payload, &mut out);
        let found: Vec<&str> = out.iter().map(String::as_str).collect();
        assert_eq!(found, vec!["media/a.png", "media/b.png", "media/t.png"]);
    }

    #[test]
    fn outstanding_work_forces_redrain() {
        let mut marker = ReapMarker {
            schema: REAP_MARKER_SCHEMA.to_string(),
            ..ReapMarker::default()
        };
        assert!(!marker.has_outstanding_work());
        marker.counts.stage1_uia_frames_missing_count = 1;
        assert!(marker.has_outstanding_work());
        marker.counts.stage1_uia_frames_missing_count = 0;
        marker.counts.stage1_missing_retention_marker_count = 2;
        assert!(marker.has_outstanding_work());

        let foreign = ReapMarker {
            schema: "something.else".to_string(),
            ..ReapMarker::default()
        };
        assert!(foreign.has_outstanding_work());
    }

    #[test]
    fn missing_database_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = tempfile::TempDir::new().unwrap();
        let err = ingest_handoff_dir(dir.path(), root.path(), &HandoffOptions::default()).unwrap_err();
        assert!(matches!(err, HandoffError::MissingDatabase(_)));
    }

    #[test]
    fn reap_marker_round_trips_through_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = ReapMarker {
            schema: REAP_MARKER_SCHEMA.to_string(),
            handoff_hash: "abc".to_string(),
            ts_utc: "2026-01-01T00:00:00Z".to_string(),
            counts: ReapCounts {
                frames: 3,
                ..ReapCounts::default()
            },
        };
        write_reap_marker(dir.path(), &marker).unwrap();
        assert_eq!(read_reap_marker(dir.path()), Some(marker));
    }
}
