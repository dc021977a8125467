//! Queryability gate: a pure verdict over an audit summary that fails closed.

use serde::Serialize;

use crate::audit::AuditSummary;

pub const DEFAULT_MIN_QUERYABLE_RATIO: f64 = 0.95;

pub const REASON_NO_FRAMES_AUDITED: &str = "no_frames_audited";
pub const REASON_NO_QUERYABLE_FRAMES: &str = "no_queryable_frames";
pub const REASON_PROCESSED_MISSING_QUERYABILITY: &str = "processed_frames_missing_queryability";
pub const REASON_RATIO_BELOW_MIN: &str = "queryable_ratio_below_min";
pub const REASON_RETENTION_GAP: &str = "retention_gap_for_processed_frames";
pub const REASON_STAGE1_MARKERS_MISSING: &str = "stage1_markers_missing";
pub const REASON_RETENTION_MARKERS_MISSING: &str = "retention_markers_missing";
pub const REASON_OBS_DOCS_MISSING: &str = "obs_docs_missing";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateVerdict {
    pub ok: bool,
    pub reasons: Vec<String>,
    pub frames_total: usize,
    pub frames_queryable: usize,
    pub stage1_ok: usize,
    pub retention_ok: usize,
    pub blocked_stage1_frames: usize,
    pub queryable_ratio: f64,
    pub min_queryable_ratio: f64,
    pub estimated: bool,
}

/// Evaluate the gate. Every failure mode contributes its own reason.
#[must_use]
pub fn evaluate(summary: &AuditSummary, min_queryable_ratio: f64) -> GateVerdict {
    let blocked = summary.stage1_ok.saturating_sub(summary.frames_queryable);
    let ratio = summary.queryable_ratio();
    let mut reasons = Vec::new();

    if summary.frames_total == 0 {
        reasons.push(REASON_NO_FRAMES_AUDITED);
    }
    if summary.frames_queryable == 0 && summary.stage1_ok > 0 {
        reasons.push(REASON_NO_QUERYABLE_FRAMES);
    }
    if blocked > 0 {
        reasons.push(REASON_PROCESSED_MISSING_QUERYABILITY);
    }
    if summary.frames_total > 0 && ratio < min_queryable_ratio {
        reasons.push(REASON_RATIO_BELOW_MIN);
    }
    if summary.retention_ok < summary.stage1_ok {
        reasons.push(REASON_RETENTION_GAP);
    }
    if summary.stage1_ok > 0 && summary.stage1_markers == Some(0) {
        reasons.push(REASON_STAGE1_MARKERS_MISSING);
    }
    if summary.stage1_ok > 0 && summary.retention_markers == Some(0) {
        reasons.push(REASON_RETENTION_MARKERS_MISSING);
    }
    if summary.uia_required > 0 && summary.obs_docs == Some(0) {
        reasons.push(REASON_OBS_DOCS_MISSING);
    }

    GateVerdict {
        ok: reasons.is_empty(),
        reasons: reasons.into_iter().map(str::to_string).collect(),
        frames_total: summary.frames_total,
        frames_queryable: summary.frames_queryable,
        stage1_ok: summary.stage1_ok,
        retention_ok: summary.retention_ok,
        blocked_stage1_frames: blocked,
        queryable_ratio: ratio,
        min_queryable_ratio,
        estimated: summary.estimated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regressed_processing_fails_with_distinct_reasons() {
        let summary = AuditSummary {
            frames_total: 7,
            frames_queryable: 3,
            stage1_ok: 6,
            retention_ok: 4,
            ..AuditSummary::default()
        };
        let verdict = evaluate(&summary, DEFAULT_MIN_QUERYABLE_RATIO);
        assert!(!verdict.ok);
        assert_eq!(verdict.blocked_stage1_frames, 3);
        for reason in [REASON_PROCESSED_MISSING_QUERYABILITY, REASON_RATIO_BELOW_MIN, REASON_RETENTION_GAP] {
            assert!(verdict.reasons.iter().any(|r| r == reason), "missing {reason}");
        }
        assert!(!verdict.reasons.iter().any(|r| r == REASON_NO_QUERYABLE_FRAMES));
    }

    #[test]
    fn empty_audit_fails_closed() {
        let verdict = evaluate(&AuditSummary::default(), 0.0);
        assert!(!verdict.ok);
        assert_eq!(verdict.reasons, vec![REASON_NO_FRAMES_AUDITED]);
    }

    #[test]
    fn nothing_queryable_is_distinguished() {
        let summary = AuditSummary {
            frames_total: 2,
            stage1_ok: 2,
            retention_ok: 2,
            ..AuditSummary::default()
        };
        let verdict = evaluate(&summary, 0.5);
        assert!(verdict.reasons.iter().any(|r| r == REASON_NO_QUERYABLE_FRAMES));
    }

    #[test]
    fn healthy_audit_passes() {
        let summary = AuditSummary {
            frames_total: 10,
            frames_queryable: 10,
            stage1_ok: 10,
            retention_ok: 10,
            uia_required: 4,
            stage1_markers: Some(10),
            retention_markers: Some(10),
            obs_docs: Some(12),
            estimated: false,
        };
        let verdict = evaluate(&summary, DEFAULT_MIN_QUERYABLE_RATIO);
        assert!(verdict.ok, "{:?}", verdict.reasons);
        assert!((verdict.queryable_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_marker_counts_fail_when_required() {
        let summary = AuditSummary {
            frames_total: 1,
            frames_queryable: 1,
            stage1_ok: 1,
            retention_ok: 1,
            uia_required: 1,
            stage1_markers: Some(1),
            retention_markers: Some(1),
            obs_docs: Some(0),
            estimated: false,
        };
        let verdict = evaluate(&summary, 0.0);
        assert_eq!(verdict.reasons, vec![REASON_OBS_DOCS_MISSING]);
    }
}
