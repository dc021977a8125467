//! Stage1: minimum structural linkage of a frame.
//!
//! A frame is Stage1-complete when it has a content hash, a blob path, a
//! fully linked UIA reference and an input reference. The completion marker
//! is written once, at an id derived from the frame id, with a payload that
//! depends only on the frame. Re-marking is a no-op.

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::hashing::{derived_id, run_id_of, seal_payload};
use crate::record::{FRAME, FrameRecord, STAGE1_COMPLETE};
use crate::store::RecordStore;

fn filled(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// Pure Stage1 predicate.
#[must_use]
pub fn is_complete(frame: &FrameRecord) -> bool {
    missing_requirements(frame).is_empty()
}

/// Names of the Stage1 requirements the frame does not meet.
#[must_use]
pub fn missing_requirements(frame: &FrameRecord) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if !filled(frame.content_hash.as_deref()) {
        missing.push("content_hash");
    }
    if !filled(frame.blob_path.as_deref()) {
        missing.push("blob_path");
    }
    if frame.linked_uia().is_none() {
        missing.push("uia_ref");
    }
    let input_linked = [frame.input_ref.as_ref(), frame.input_batch_ref.as_ref()]
        .into_iter()
        .flatten()
        .any(|r| filled(r.record_id.as_deref()));
    if !input_linked {
        missing.push("input_ref");
    }
    missing
}

/// Deterministic marker id for a frame.
#[must_use]
pub fn marker_id(frame_id: &str) -> String {
    derived_id(run_id_of(frame_id), STAGE1_COMPLETE, frame_id)
}

/// Sealed marker payload. `None` when the frame is not complete.
#[must_use]
pub fn build_marker(frame_id: &str, frame: &FrameRecord) -> Option<Value> {
    if !is_complete(frame) {
        return None;
    }
    let (uia_record_id, uia_content_hash) = frame.linked_uia()?;
    let mut payload = json!({
        "record_type": STAGE1_COMPLETE,
        "run_id": run_id_of(frame_id),
        "ts_utc": frame.ts_utc,
        "source_record_id": frame_id,
        "source_record_type": FRAME,
        "complete": true,
        "uia_record_id": uia_record_id,
        "uia_content_hash": uia_content_hash,
    });
    seal_payload(&mut payload);
    Some(payload)
}

/// Write the Stage1 marker if the frame is complete.
///
/// Returns the marker id when the marker exists after the call. Write
/// failures are logged and reported as `None`; the next pass retries.
pub fn mark_complete(store: &dyn RecordStore, frame_id: &str, frame: &FrameRecord) -> Option<String> {
    let id = marker_id(frame_id);
    let Some(payload) = build_marker(frame_id, frame) else {
        // A marker left from an earlier complete state stays until
        // revalidation quarantines the frame's retention marker.
        if store.contains(&id).unwrap_or(false) {
            debug!(
                frame_id,
                record_id = %id,
                missing = ?missing_requirements(frame),
                "Frame no longer Stage1-complete but keeps an existing marker"
            );
        }
        return None;
    };
    match store.insert_if_absent(&id, &payload) {
        Ok(inserted) => {
            debug!(frame_id, record_id = %id, inserted, "Stage1 marker");
            Some(id)
        }
        Err(e) => {
            warn!(frame_id, record_id = %id, error = %e, "Stage1 marker write failed");
            None
        }
    }
}
