//! Retention eligibility markers and the age-cutoff deletion pass.
//!
//! # Eligibility
//!
//! A frame's `retention.eligible` marker is the one mutable derived record.
//! [`mark_eligible`] writes it with `stage1_contract_validated` and
//! `quarantine_pending` set from the lineage verdict, and rewrites it when the
//! verdict changes. Non-frame evidence goes through [`mark_legacy_eligible`],
//! which carries no Stage1 validation at all.
//!
//! # Deletion
//!
//! [`apply_retention`] refuses to run while `no_deletion_mode` is set, when
//! the retention spec is disabled, or when the per-run budget is zero. It
//! then walks evidence older than the cutoff, oldest first, until
//! `max_delete_per_run` deletions have been attempted or the window is
//! exhausted. Ineligible and unprocessed records are passed over, not
//! counted against the budget. Deleted ids and ids whose blob was already
//! gone are recorded in one sealed `derived.retention.batch` record plus a
//! journal entry; later passes skip both.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::error::StoreError;
use crate::hashing::{derived_id, hashed_id, run_id_of, seal_payload};
use crate::journal;
use crate::media::MediaStore;
use crate::record::{
    EVIDENCE_PREFIX, FRAME, FrameRecord, RETENTION_BATCH, RETENTION_ELIGIBLE, Record, RetentionMarker, format_ts,
};
use crate::stage1;
use crate::store::RecordStore;

// =============================================================================
// Retention spec
// =============================================================================

/// Parsed `storage.retention.evidence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionSpec {
    /// Keep forever
    Disabled,
    Seconds(u64),
}

/// Parse `<int><unit>` (unit `d`, `h`, `m` or `s`; bare integers are days).
/// `0`, `infinite`, `off`, `none` and `disabled` mean no retention.
#[must_use]
pub fn parse_retention_spec(raw: &str) -> Option<RetentionSpec> {
    let spec = raw.trim().to_ascii_lowercase();
    if matches!(spec.as_str(), "infinite" | "off" | "none" | "disabled") {
        return Some(RetentionSpec::Disabled);
    }
    let (digits, multiplier) = match spec.char_indices().last()? {
        (i, 'd') => (&spec[..i], 86_400),
        (i, 'h') => (&spec[..i], 3_600),
        (i, 'm') => (&spec[..i], 60),
        (i, 's') => (&spec[..i], 1),
        _ => (spec.as_str(), 86_400),
    };
    let amount: u64 = digits.trim().parse().ok()?;
    if amount == 0 {
        return Some(RetentionSpec::Disabled);
    }
    amount.checked_mul(multiplier).map(RetentionSpec::Seconds)
}

// =============================================================================
// Eligibility markers
// =============================================================================

#[must_use]
pub fn marker_id(record_id: &str) -> String {
    derived_id(run_id_of(record_id), RETENTION_ELIGIBLE, record_id)
}

/// Sealed retention marker payload for a frame.
#[must_use]
pub fn build_marker(frame_id: &str, frame: &FrameRecord, validated: bool) -> Value {
    let mut payload = json!({
        "record_type": RETENTION_ELIGIBLE,
        "run_id": run_id_of(frame_id),
        "ts_utc": frame.ts_utc,
        "source_record_id": frame_id,
        "source_record_type": FRAME,
        "eligible": true,
        "stage1_contract_validated": validated,
        "quarantine_pending": !validated,
        "stage1_record_id": stage1::marker_id(frame_id),
    });
    seal_payload(&mut payload);
    payload
}

fn upsert(store: &dyn RecordStore, id: &str, payload: &Value) -> Result<bool, StoreError> {
    if store.get(id)?.as_ref() == Some(payload) {
        return Ok(false);
    }
    store.put(id, payload)?;
    Ok(true)
}

/// Write or correct a frame's retention marker. `validated = false` writes a
/// quarantined marker. Returns the marker id, or `None` if the write failed
/// (logged; the next pass retries).
pub fn mark_eligible(
    store: &dyn RecordStore,
    frame_id: &str,
    frame: &FrameRecord,
    validated: bool,
) -> Option<String> {
    let id = marker_id(frame_id);
    let payload = build_marker(frame_id, frame, validated);
    match upsert(store, &id, &payload) {
        Ok(changed) => {
            debug!(frame_id, record_id = %id, validated, changed, "Retention marker");
            Some(id)
        }
        Err(e) => {
            warn!(frame_id, record_id = %id, error = %e, "Retention marker write failed");
            None
        }
    }
}

/// Eligibility for non-frame evidence. This path does not consult Stage1 and
/// never sets `stage1_contract_validated`.
pub fn mark_legacy_eligible(
    store: &dyn RecordStore,
    record_id: &str,
    record_type: &str,
    ts_utc: Option<&str>,
) -> Option<String> {
    if record_type == FRAME {
        warn!(record_id, "Frames must use the validated retention path");
        return None;
    }
    let id = marker_id(record_id);
    let mut payload = json!({
        "record_type": RETENTION_ELIGIBLE,
        "run_id": run_id_of(record_id),
        "ts_utc": ts_utc,
        "source_record_id": record_id,
        "source_record_type": record_type,
        "eligible": true,
        "legacy": true,
    });
    seal_payload(&mut payload);
    match upsert(store, &id, &payload) {
        Ok(_) => Some(id),
        Err(e) => {
            warn!(record_id, error = %e, "Legacy retention marker write failed");
            None
        }
    }
}

/// Load a decoded retention marker.
pub fn load_marker(store: &dyn RecordStore, record_id: &str) -> Result<Option<RetentionMarker>, StoreError> {
    let Some(payload) = store.get(&marker_id(record_id))? else {
        return Ok(None);
    };
    Ok(match Record::decode(&payload) {
        Ok(Record::Retention(marker)) => Some(marker),
        _ => None,
    })
}

fn is_processed(marker: Option<&RetentionMarker>, record_type: &str) -> bool {
    let Some(marker) = marker else {
        return false;
    };
    if record_type == FRAME {
        marker.is_validated()
    } else {
        marker.eligible == Some(true) && marker.quarantine_pending != Some(true)
    }
}

// =============================================================================
// Deletion pass
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionResult {
    pub cutoff_ts_utc: String,
    pub dry_run: bool,
    /// Records examined in the window, excluding ones settled by earlier batches
    pub candidates: usize,
    pub attempted: usize,
    pub deleted: usize,
    /// Blob already gone, or delete failed
    pub missing: usize,
    pub skipped_ineligible: usize,
    pub skipped_unprocessed: usize,
    pub deleted_ids: Vec<String>,
    pub missing_ids: Vec<String>,
    pub batch_record_id: Option<String>,
    pub journal_hash: Option<String>,
}

/// Ids settled by earlier batch records: deleted, or found without a blob.
fn settled_ids(store: &dyn RecordStore) -> Result<BTreeSet<String>, StoreError> {
    let mut ids = BTreeSet::new();
    for batch_id in store.ids_of_type(RETENTION_BATCH)? {
        if let Some(payload) = store.get(&batch_id)? {
            if let Ok(Record::RetentionBatch(batch)) = Record::decode(&payload) {
                ids.extend(batch.deleted_ids);
                ids.extend(batch.missing_ids);
            }
        }
    }
    Ok(ids)
}

enum Candidate {
    Eligible { blob_path: String },
    Ineligible,
    Unprocessed,
}

fn classify(
    store: &dyn RecordStore,
    id: &str,
    payload: &Value,
    config: &RetentionConfig,
) -> Result<Candidate, StoreError> {
    let record_type = payload.get("record_type").and_then(Value::as_str).unwrap_or_default();
    if !record_type.starts_with(EVIDENCE_PREFIX) || (config.images_only && record_type != FRAME) {
        return Ok(Candidate::Ineligible);
    }
    let has_identity = payload
        .get("content_hash")
        .and_then(Value::as_str)
        .is_some_and(|h| !h.is_empty())
        || payload.get("size_bytes").and_then(Value::as_u64).is_some();
    let blob_path = payload
        .get("blob_path")
        .and_then(Value::as_str)
        .filter(|p| !p.trim().is_empty());
    let (true, Some(blob_path)) = (has_identity, blob_path) else {
        return Ok(Candidate::Ineligible);
    };
    if config.processed_only {
        let marker = load_marker(store, id)?;
        if !is_processed(marker.as_ref(), record_type) {
            return Ok(Candidate::Unprocessed);
        }
    }
    Ok(Candidate::Eligible {
        blob_path: blob_path.to_string(),
    })
}

/// Classify one record and, when eligible, delete (or in a dry run, probe)
/// its blob.
fn consider(
    store: &dyn RecordStore,
    media: &dyn MediaStore,
    config: &RetentionConfig,
    dry_run: bool,
    id: &str,
    result: &mut RetentionResult,
) -> Result<(), StoreError> {
    let Some(payload) = store.get(id)? else {
        result.skipped_ineligible += 1;
        return Ok(());
    };
    let blob_path = match classify(store, id, &payload, config)? {
        Candidate::Eligible { blob_path } => blob_path,
        Candidate::Ineligible => {
            result.skipped_ineligible += 1;
            return Ok(());
        }
        Candidate::Unprocessed => {
            result.skipped_unprocessed += 1;
            return Ok(());
        }
    };
    result.attempted += 1;
    let outcome = if dry_run {
        Ok(media.exists(&blob_path))
    } else {
        media.delete_blob(&blob_path)
    };
    match outcome {
        Ok(true) => {
            result.deleted += 1;
            result.deleted_ids.push(id.to_string());
        }
        Ok(false) => {
            result.missing += 1;
            result.missing_ids.push(id.to_string());
        }
        // Not settled: the next pass retries it.
        Err(e) => {
            warn!(record_id = %id, blob_path, error = %e, "Media delete failed");
            result.missing += 1;
        }
    }
    Ok(())
}

/// Run one retention pass. `Ok(None)` means the policy refused to run.
pub fn apply_retention(
    store: &dyn RecordStore,
    media: &dyn MediaStore,
    config: &RetentionConfig,
    dry_run: bool,
    now: DateTime<Utc>,
    journal_path: Option<&Path>,
) -> Result<Option<RetentionResult>, StoreError> {
    if config.no_deletion_mode {
        debug!("Retention skipped: no_deletion_mode");
        return Ok(None);
    }
    let seconds = match parse_retention_spec(&config.evidence) {
        Some(RetentionSpec::Seconds(seconds)) => seconds,
        Some(RetentionSpec::Disabled) | None => {
            debug!(spec = %config.evidence, "Retention skipped: disabled");
            return Ok(None);
        }
    };
    let budget = config.max_delete_per_run;
    if budget == 0 {
        return Ok(None);
    }

    let cutoff = i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let cutoff_ts = format_ts(cutoff);

    let mut result = RetentionResult {
        cutoff_ts_utc: cutoff_ts.clone(),
        dry_run,
        ..RetentionResult::default()
    };

    // Page through the window so records that are passed over cannot starve
    // deletable ones behind them.
    let settled = settled_ids(store)?;
    let mut fetch = budget.saturating_add(settled.len());
    let mut seen = 0;
    'scan: loop {
        let window = store.ids_in_window(EVIDENCE_PREFIX, &cutoff_ts, fetch)?;
        let exhausted = window.len() < fetch;
        for entry in window.into_iter().skip(seen) {
            if result.attempted >= budget {
                break 'scan;
            }
            seen += 1;
            if settled.contains(&entry.id) {
                continue;
            }
            result.candidates += 1;
            consider(store, media, config, dry_run, &entry.id, &mut result)?;
        }
        if exhausted || result.attempted >= budget {
            break;
        }
        fetch = fetch.saturating_add(budget);
    }

    let settled_now = result.deleted_ids.first().or_else(|| result.missing_ids.first());
    if let (false, Some(first)) = (dry_run, settled_now) {
        let batch_id = hashed_id(
            run_id_of(first),
            RETENTION_BATCH,
            &format!(
                "{cutoff_ts}|{}|{}",
                result.deleted_ids.join(","),
                result.missing_ids.join(",")
            ),
        );
        let mut batch = json!({
            "record_type": RETENTION_BATCH,
            "ts_utc": format_ts(now),
            "cutoff_ts_utc": cutoff_ts,
            "deleted_ids": result.deleted_ids,
            "deleted_count": result.deleted,
            "missing_ids": result.missing_ids,
        });
        seal_payload(&mut batch);
        store.insert_if_absent(&batch_id, &batch)?;
        if let Some(path) = journal_path {
            result.journal_hash = journal::append_best_effort(path, "retention.batch", batch, &format_ts(now));
        }
        result.batch_record_id = Some(batch_id);
    }

    info!(
        cutoff = %result.cutoff_ts_utc,
        dry_run,
        candidates = result.candidates,
        attempted = result.attempted,
        deleted = result.deleted,
        missing = result.missing,
        skipped_ineligible = result.skipped_ineligible,
        skipped_unprocessed = result.skipped_unprocessed,
        "Retention pass"
    );
    Ok(Some(result))
}

/// Whether enough time has passed since the last run.
#[must_use]
pub fn is_due(last_run: Option<DateTime<Utc>>, now: DateTime<Utc>, interval_s: u64) -> bool {
    let interval = i64::try_from(interval_s).unwrap_or(i64::MAX);
    last_run.is_none_or(|last| (now - last).num_seconds() >= interval)
}
