//! Offline lineage repair.
//!
//! Every procedure here reads normalized records only (never capture media),
//! is idempotent, and supports `dry_run`, which computes the same counts
//! without writing.
//!
//! - [`backfill_frames`]: observation documents, Stage2 output, Stage1 and
//!   retention markers for frames that lack them
//! - [`backfill_stage2`]: Stage2 output alone
//! - [`revalidate_markers`]: re-derive every frame retention marker's
//!   validity from current Stage1 evidence
//! - [`repair_queryability`]: audit, backfill, revalidate, audit again
//! - [`validate_stage1_lineage`]: check each Stage1 marker against its frame

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditOptions, AuditSummary};
use crate::error::StoreError;
use crate::gate::{self, GateVerdict};
use crate::hashing::{seal_payload, verify_payload_hash};
use crate::lineage;
use crate::pipeline::{PipelineContext, process_frame};
use crate::record::{FRAME, FrameRecord, RETENTION_ELIGIBLE, Record, STAGE1_COMPLETE};
use crate::retention;
use crate::stage1;
use crate::stage2;
use crate::store::RecordStore;
use crate::uia;

fn frames(store: &dyn RecordStore) -> Result<Vec<(String, FrameRecord)>, StoreError> {
    let mut out = Vec::new();
    for id in store.ids_of_type(FRAME)? {
        if let Some(payload) = store.get(&id)? {
            if let Ok(frame) = Record::frame(&payload) {
                out.push((id, frame));
            }
        }
    }
    Ok(out)
}

// =============================================================================
// Backfill
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillResult {
    pub dry_run: bool,
    pub frames_scanned: usize,
    pub frames_needing_work: usize,
    pub frames_processed: usize,
    pub obs_docs_inserted: usize,
    pub stage2_docs_inserted: usize,
    pub stage2_states_inserted: usize,
    pub stage1_markers_inserted: usize,
    pub retention_markers_written: usize,
    /// Frames still blocked on UIA observations after the pass
    pub uia_frames_missing: usize,
}

fn needs_work(store: &dyn RecordStore, frame_id: &str, frame: &FrameRecord) -> Result<bool, StoreError> {
    if !store.contains(&stage2::marker_id(frame_id))? {
        return Ok(true);
    }
    let lineage = lineage::evaluate_frame(store, frame_id, frame)?;
    Ok(!lineage.queryable && lineage.stage1_complete)
}

/// Bring frames that predate (or were interrupted in) the pipeline up to
/// date. At most `limit` frames needing work are touched.
pub fn backfill_frames(ctx: &PipelineContext<'_>, dry_run: bool, limit: usize) -> Result<BackfillResult, StoreError> {
    let mut result = BackfillResult {
        dry_run,
        ..BackfillResult::default()
    };
    for (frame_id, frame) in frames(ctx.store)? {
        result.frames_scanned += 1;
        if !needs_work(ctx.store, &frame_id, &frame)? {
            continue;
        }
        result.frames_needing_work += 1;
        if result.frames_processed >= limit {
            continue;
        }
        result.frames_processed += 1;

        if dry_run {
            let uia = uia::materialize_for_frame(ctx.store, ctx.data_root, &frame_id, &frame, ctx.uia, true)?;
            let stage2 = stage2::project_frame(ctx.store, &frame_id, &frame, true)?;
            result.obs_docs_inserted += uia.inserted;
            result.stage2_docs_inserted += stage2.inserted_docs;
            result.stage2_states_inserted += stage2.inserted_states;
            let would_mark = stage1::is_complete(&frame) && !ctx.store.contains(&stage1::marker_id(&frame_id))?;
            result.stage1_markers_inserted += usize::from(would_mark);
            result.uia_frames_missing += usize::from(uia.required && !uia.ok);
            continue;
        }

        let had_stage1 = ctx.store.contains(&stage1::marker_id(&frame_id))?;
        let retention_before = ctx.store.get(&retention::marker_id(&frame_id))?;
        let outcome = process_frame(ctx, &frame_id, &frame)?;
        result.obs_docs_inserted += outcome.uia.inserted;
        result.stage2_docs_inserted += outcome.stage2.inserted_docs;
        result.stage2_states_inserted += outcome.stage2.inserted_states;
        result.stage1_markers_inserted += usize::from(!had_stage1 && outcome.stage1_marker.is_some());
        if outcome.retention_marker.is_some() && ctx.store.get(&retention::marker_id(&frame_id))? != retention_before {
            result.retention_markers_written += 1;
        }
        result.uia_frames_missing += usize::from(outcome.uia.required && !outcome.uia.ok);
    }
    info!(
        dry_run,
        scanned = result.frames_scanned,
        processed = result.frames_processed,
        stage1 = result.stage1_markers_inserted,
        retention = result.retention_markers_written,
        "Frame backfill"
    );
    Ok(result)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stage2Backfill {
    pub dry_run: bool,
    pub frames_scanned: usize,
    pub frames_missing_stage2: usize,
    pub frames_processed: usize,
    pub docs_inserted: usize,
    pub states_inserted: usize,
    pub errors: Vec<String>,
}

/// Stage2 projection for frames without a Stage2 marker.
pub fn backfill_stage2(store: &dyn RecordStore, dry_run: bool, limit: usize) -> Result<Stage2Backfill, StoreError> {
    let mut result = Stage2Backfill {
        dry_run,
        ..Stage2Backfill::default()
    };
    for (frame_id, frame) in frames(store)? {
        result.frames_scanned += 1;
        if store.contains(&stage2::marker_id(&frame_id))? {
            continue;
        }
        result.frames_missing_stage2 += 1;
        if result.frames_processed >= limit {
            continue;
        }
        result.frames_processed += 1;
        let projected = stage2::project_frame(store, &frame_id, &frame, dry_run)?;
        result.docs_inserted += projected.inserted_docs;
        result.states_inserted += projected.inserted_states;
        result.errors.extend(projected.errors);
    }
    Ok(result)
}

// =============================================================================
// Revalidation
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevalidateResult {
    pub dry_run: bool,
    pub markers_scanned: usize,
    pub already_correct: usize,
    pub upgraded: usize,
    pub quarantined: usize,
    /// Legacy markers on non-frame evidence, left untouched
    pub skipped_legacy: usize,
    pub skipped_undecodable: usize,
}

fn quarantine_in_place(payload: &Value) -> Value {
    let mut updated = payload.clone();
    if let Value::Object(map) = &mut updated {
        map.insert("stage1_contract_validated".to_string(), Value::Bool(false));
        map.insert("quarantine_pending".to_string(), Value::Bool(true));
    }
    seal_payload(&mut updated);
    updated
}

/// Re-derive `stage1_contract_validated` for every frame retention marker and
/// rewrite markers whose stored state disagrees. Processes at most `limit`
/// markers.
pub fn revalidate_markers(store: &dyn RecordStore, dry_run: bool, limit: usize) -> Result<RevalidateResult, StoreError> {
    let mut result = RevalidateResult {
        dry_run,
        ..RevalidateResult::default()
    };
    for marker_id in store.ids_of_type(RETENTION_ELIGIBLE)?.into_iter().take(limit) {
        result.markers_scanned += 1;
        let Some(payload) = store.get(&marker_id)? else { continue };
        let Ok(Record::Retention(marker)) = Record::decode(&payload) else {
            result.skipped_undecodable += 1;
            continue;
        };
        let frame_id = marker.source_record_id.clone();
        let frame_payload = store.get(&frame_id)?;
        let is_frame_marker = marker.source_record_type.as_deref().is_none_or(|t| t == FRAME);
        if !is_frame_marker {
            result.skipped_legacy += 1;
            continue;
        }

        let frame = frame_payload.as_ref().and_then(|p| Record::frame(p).ok());
        let validated = match &frame {
            Some(frame) => lineage::evaluate_frame(store, &frame_id, frame)?.stage1_contract_ok(),
            None => false,
        };
        let correct = if validated {
            marker.is_validated()
        } else {
            marker.stage1_contract_validated == Some(false) && marker.quarantine_pending == Some(true)
        };
        if correct {
            result.already_correct += 1;
            continue;
        }
        if validated {
            result.upgraded += 1;
        } else {
            result.quarantined += 1;
        }
        if dry_run {
            continue;
        }
        match &frame {
            Some(frame) => {
                if retention::mark_eligible(store, &frame_id, frame, validated).is_none() {
                    warn!(frame_id, "Revalidation write failed");
                }
            }
            None => store.put(&marker_id, &quarantine_in_place(&payload))?,
        }
        debug!(frame_id, validated, "Retention marker revalidated");
    }
    Ok(result)
}

// =============================================================================
// End-to-end repair
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairReport {
    pub dry_run: bool,
    pub before: AuditSummary,
    pub before_ratio: f64,
    pub backfill: BackfillResult,
    pub revalidate: RevalidateResult,
    pub after: AuditSummary,
    pub after_ratio: f64,
    pub gate: GateVerdict,
}

/// Audit, backfill, revalidate, audit again.
pub fn repair_queryability(
    ctx: &PipelineContext<'_>,
    min_queryable_ratio: f64,
    dry_run: bool,
    limit: usize,
) -> Result<RepairReport, StoreError> {
    let options = AuditOptions {
        samples: 0,
        ..AuditOptions::default()
    };
    let before = audit::audit_store(ctx.store, &options)?.summary;
    let backfill = backfill_frames(ctx, dry_run, limit)?;
    let revalidate = revalidate_markers(ctx.store, dry_run, usize::MAX)?;
    let after = audit::audit_store(ctx.store, &options)?.summary;
    let gate = gate::evaluate(&after, min_queryable_ratio);
    info!(
        dry_run,
        before = before.queryable_ratio(),
        after = after.queryable_ratio(),
        ok = gate.ok,
        "Queryability repair"
    );
    Ok(RepairReport {
        dry_run,
        before_ratio: before.queryable_ratio(),
        after_ratio: after.queryable_ratio(),
        before,
        backfill,
        revalidate,
        after,
        gate,
    })
}

// =============================================================================
// Stage1 lineage validation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineageSample {
    pub marker_id: String,
    pub frame_id: String,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LineageValidation {
    pub markers_total: usize,
    pub markers_valid: usize,
    pub markers_invalid: usize,
    pub issue_counts: BTreeMap<String, usize>,
    pub samples: Vec<LineageSample>,
}

fn marker_issues(store: &dyn RecordStore, payload: &Value) -> Result<(String, Vec<String>), StoreError> {
    let mut issues = Vec::new();
    let marker = match Record::decode(payload) {
        Ok(Record::Stage1(marker)) => marker,
        _ => return Ok((String::new(), vec!["marker_undecodable".to_string()])),
    };
    if !marker.complete {
        issues.push("marker_not_complete".to_string());
    }
    if verify_payload_hash(payload) == Some(false) {
        issues.push("payload_hash_mismatch".to_string());
    }
    if marker.source_record_type.as_deref().is_some_and(|t| t != FRAME) {
        issues.push("source_not_a_frame".to_string());
    }
    let frame = match store.get(&marker.source_record_id)? {
        None => {
            issues.push("frame_missing".to_string());
            None
        }
        Some(frame_payload) => match Record::frame(&frame_payload) {
            Ok(frame) => Some(frame),
            Err(_) => {
                issues.push("frame_undecodable".to_string());
                None
            }
        },
    };
    if let Some(frame) = frame {
        if !stage1::is_complete(&frame) {
            issues.push("frame_not_stage1_complete".to_string());
        }
        let agrees = frame.linked_uia().is_some_and(|(id, hash)| {
            marker.uia_record_id.as_deref() == Some(id) && marker.uia_content_hash.as_deref() == Some(hash)
        });
        if !agrees {
            issues.push("uia_ref_mismatch".to_string());
        }
    }
    Ok((marker.source_record_id, issues))
}

/// Check every Stage1 marker against its source frame.
pub fn validate_stage1_lineage(store: &dyn RecordStore, samples: usize) -> Result<LineageValidation, StoreError> {
    let mut report = LineageValidation::default();
    for marker_id in store.ids_of_type(STAGE1_COMPLETE)? {
        let Some(payload) = store.get(&marker_id)? else { continue };
        report.markers_total += 1;
        let (frame_id, mut issues) = marker_issues(store, &payload)?;
        if !frame_id.is_empty() && stage1::marker_id(&frame_id) != marker_id {
            issues.push("marker_id_mismatch".to_string());
        }
        if issues.is_empty() {
            report.markers_valid += 1;
            continue;
        }
        report.markers_invalid += 1;
        for issue in &issues {
            *report.issue_counts.entry(issue.clone()).or_default() += 1;
        }
        if report.samples.len() < samples {
            report.samples.push(LineageSample {
                marker_id,
                frame_id,
                issues,
            });
        }
    }
    Ok(report)
}

// =============================================================================
// Stable-file wait
// =============================================================================

fn fingerprint(path: &Path) -> Option<(u64, SystemTime)> {
    let meta = fs::metadata(path).ok()?;
    Some((meta.len(), meta.modified().ok()?))
}

/// Poll `path` until its size and mtime stay unchanged for `stable_for`.
/// Returns `false` when `timeout` elapses first.
pub fn wait_for_stable(path: &Path, stable_for: Duration, timeout: Duration) -> bool {
    let start = Instant::now();
    let poll = (stable_for / 4).clamp(Duration::from_millis(10), Duration::from_millis(500));
    let mut last = fingerprint(path);
    let mut since = Instant::now();
    loop {
        if since.elapsed() >= stable_for {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(poll);
        let current = fingerprint(path);
        if current != last {
            last = current;
            since = Instant::now();
        }
    }
}
