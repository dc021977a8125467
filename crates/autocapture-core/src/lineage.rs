//! The queryability predicate.
//!
//! A frame is queryable iff:
//! - its Stage1 marker exists, is `complete`, points back at the frame and
//!   its payload hash verifies,
//! - its retention marker has `stage1_contract_validated = true` and is not
//!   quarantined,
//! - when the frame carries a `uia_ref`, all three observation documents
//!   exist at their expected ids, agree with the frame on
//!   `source_record_id`/`uia_record_id`/`uia_content_hash`, and sit within
//!   [`MAX_OBS_DRIFT_SECONDS`] of the frame's timestamp.
//!
//! The write path (retention marking), the auditor and the repair tools all
//! call [`evaluate_frame`], so they cannot disagree.

use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::hashing::verify_payload_hash;
use crate::record::{FrameRecord, ObsSection, Record, parse_ts};
use crate::store::RecordStore;
use crate::{retention, stage1, uia};

pub const MAX_OBS_DRIFT_SECONDS: i64 = 600;

pub const ISSUE_STAGE1_INCOMPLETE: &str = "stage1_incomplete";
pub const ISSUE_STAGE1_MARKER_MISSING: &str = "stage1_marker_missing";
pub const ISSUE_STAGE1_MARKER_INVALID: &str = "stage1_marker_invalid";
pub const ISSUE_RETENTION_MARKER_MISSING: &str = "retention_marker_missing";
pub const ISSUE_RETENTION_NOT_VALIDATED: &str = "retention_not_validated";
pub const ISSUE_RETENTION_QUARANTINED: &str = "retention_quarantined";

/// Observation document state for one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObsState {
    Ok,
    Missing,
    Mismatch,
    Stale,
}

impl ObsState {
    #[must_use]
    pub fn issue(self, section: ObsSection) -> Option<String> {
        let suffix = match self {
            Self::Ok => return None,
            Self::Missing => "missing",
            Self::Mismatch => "mismatch",
            Self::Stale => "stale",
        };
        Some(format!("obs_{}_{suffix}", section.name()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameLineage {
    pub frame_id: String,
    pub ts_utc: Option<String>,
    /// Frame meets the Stage1 predicate
    pub stage1_complete: bool,
    /// Stage1 predicate holds and a valid marker exists
    pub stage1_ok: bool,
    pub retention_ok: bool,
    pub uia_required: bool,
    pub observation_ok: bool,
    pub queryable: bool,
    pub issues: Vec<String>,
}

impl FrameLineage {
    /// What the retention marker's `stage1_contract_validated` should say.
    #[must_use]
    pub fn stage1_contract_ok(&self) -> bool {
        self.stage1_ok && (!self.uia_required || self.observation_ok)
    }
}

/// Check the Stage1 marker at its derived id.
pub fn stage1_marker_state(
    store: &dyn RecordStore,
    frame_id: &str,
    frame: &FrameRecord,
) -> Result<Option<&'static str>, StoreError> {
    let Some(payload) = store.get(&stage1::marker_id(frame_id))? else {
        return Ok(Some(ISSUE_STAGE1_MARKER_MISSING));
    };
    let valid = match Record::decode(&payload) {
        Ok(Record::Stage1(marker)) => {
            let uia_agrees = frame.linked_uia().is_none_or(|(id, hash)| {
                marker.uia_record_id.as_deref() == Some(id)
                    && marker.uia_content_hash.as_deref() == Some(hash)
            });
            marker.complete
                && marker.source_record_id == frame_id
                && uia_agrees
                && verify_payload_hash(&payload) != Some(false)
        }
        _ => false,
    };
    Ok((!valid).then_some(ISSUE_STAGE1_MARKER_INVALID))
}

fn observation_state(
    store: &dyn RecordStore,
    frame_id: &str,
    frame: &FrameRecord,
    section: ObsSection,
    uia_record_id: &str,
    uia_content_hash: &str,
) -> Result<ObsState, StoreError> {
    let id = uia::obs_doc_id(frame_id, section, uia_record_id, uia_content_hash);
    let Some(payload) = store.get(&id)? else {
        return Ok(ObsState::Missing);
    };
    let doc = match Record::decode(&payload) {
        Ok(Record::Observation(doc_section, doc)) if doc_section == section => doc,
        _ => return Ok(ObsState::Mismatch),
    };
    if doc.source_record_id != frame_id
        || doc.uia_record_id != uia_record_id
        || doc.uia_content_hash != uia_content_hash
    {
        return Ok(ObsState::Mismatch);
    }
    // Drift is only checked when both timestamps parse.
    if let (Some(frame_ts), Some(doc_ts)) = (frame.ts(), doc.ts_utc.as_deref().and_then(parse_ts)) {
        if (doc_ts - frame_ts).num_seconds().abs() > MAX_OBS_DRIFT_SECONDS {
            return Ok(ObsState::Stale);
        }
    }
    Ok(ObsState::Ok)
}

/// Per-section observation states. Empty when the frame has no `uia_ref`.
pub fn observation_states(
    store: &dyn RecordStore,
    frame_id: &str,
    frame: &FrameRecord,
) -> Result<Vec<(ObsSection, ObsState)>, StoreError> {
    if !frame.has_uia_ref() {
        return Ok(Vec::new());
    }
    let Some((uia_record_id, uia_content_hash)) = frame.linked_uia() else {
        return Ok(ObsSection::ALL.iter().map(|s| (*s, ObsState::Missing)).collect());
    };
    ObsSection::ALL
        .iter()
        .map(|section| {
            observation_state(store, frame_id, frame, *section, uia_record_id, uia_content_hash)
                .map(|state| (*section, state))
        })
        .collect()
}

/// Evaluate every lineage predicate for one frame.
pub fn evaluate_frame(
    store: &dyn RecordStore,
    frame_id: &str,
    frame: &FrameRecord,
) -> Result<FrameLineage, StoreError> {
    let mut issues = Vec::new();

    let stage1_complete = stage1::is_complete(frame);
    if !stage1_complete {
        issues.push(ISSUE_STAGE1_INCOMPLETE.to_string());
    }
    let marker_issue = stage1_marker_state(store, frame_id, frame)?;
    if let Some(issue) = marker_issue {
        issues.push(issue.to_string());
    }
    let stage1_ok = stage1_complete && marker_issue.is_none();

    let retention_ok = match retention_marker_state(store, frame_id)? {
        Ok(()) => true,
        Err(found) => {
            issues.extend(found.into_iter().map(str::to_string));
            false
        }
    };

    let uia_required = frame.has_uia_ref();
    let mut observation_ok = true;
    for (section, state) in observation_states(store, frame_id, frame)? {
        if let Some(issue) = state.issue(section) {
            observation_ok = false;
            issues.push(issue);
        }
    }

    let queryable = stage1_ok && retention_ok && (!uia_required || observation_ok);
    Ok(FrameLineage {
        frame_id: frame_id.to_string(),
        ts_utc: frame.ts_utc.clone(),
        stage1_complete,
        stage1_ok,
        retention_ok,
        uia_required,
        observation_ok,
        queryable,
        issues,
    })
}

fn retention_marker_state(
    store: &dyn RecordStore,
    frame_id: &str,
) -> Result<Result<(), Vec<&'static str>>, StoreError> {
    let Some(payload) = store.get(&retention::marker_id(frame_id))? else {
        return Ok(Err(vec![ISSUE_RETENTION_MARKER_MISSING]));
    };
    let Ok(Record::Retention(marker)) = Record::decode(&payload) else {
        return Ok(Err(vec![ISSUE_RETENTION_NOT_VALIDATED]));
    };
    let mut issues = Vec::new();
    if marker.stage1_contract_validated != Some(true) || marker.eligible == Some(false) {
        issues.push(ISSUE_RETENTION_NOT_VALIDATED);
    }
    if marker.quarantine_pending == Some(true) {
        issues.push(ISSUE_RETENTION_QUARANTINED);
    }
    Ok(if issues.is_empty() { Ok(()) } else { Err(issues) })
}

/// Decode the frame at `frame_id` and evaluate it. `None` when the id is
/// absent or not a decodable frame.
pub fn evaluate_frame_id(store: &dyn RecordStore, frame_id: &str) -> Result<Option<FrameLineage>, StoreError> {
    let Some(payload) = store.get(frame_id)? else {
        return Ok(None);
    };
    match Record::frame(&payload) {
        Ok(frame) => evaluate_frame(store, frame_id, &frame).map(Some),
        Err(_) => Ok(None),
    }
}

/// Raw helper used by callers holding an undecoded payload.
pub fn evaluate_payload(
    store: &dyn RecordStore,
    frame_id: &str,
    payload: &Value,
) -> Result<Option<FrameLineage>, StoreError> {
    match Record::frame(payload) {
        Ok(frame) => evaluate_frame(store, frame_id, &frame).map(Some),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage1::tests::complete_frame;
    use crate::store::InMemoryStore;
    use serde_json::json;

    const FRAME_ID: &str = "run1/evidence.capture.frame/1";

    fn write_obs(store: &InMemoryStore, section: ObsSection, ts: &str, hash: &str) {
        let id = uia::obs_doc_id(FRAME_ID, section, "U1", "h1");
        store
            .put(
                &id,
                &json!({
                    "record_type": section.record_type(),
                    "ts_utc": ts,
                    "source_record_id": FRAME_ID,
                    "uia_record_id": "U1",
                    "uia_content_hash": hash,
                }),
            )
            .unwrap();
    }

    fn fully_linked() -> InMemoryStore {
        let store = InMemoryStore::new();
        let frame = complete_frame();
        stage1::mark_complete(&store, FRAME_ID, &frame).unwrap();
        for section in ObsSection::ALL {
            write_obs(&store, section, "2026-01-01T00:01:00Z", "h1");
        }
        retention::mark_eligible(&store, FRAME_ID, &frame, true).unwrap();
        store
    }

    #[test]
    fn fully_linked_frame_is_queryable() {
        let store = fully_linked();
        let lineage = evaluate_frame(&store, FRAME_ID, &complete_frame()).unwrap();
        assert!(lineage.queryable, "{:?}", lineage.issues);
        assert!(lineage.issues.is_empty());
    }

    #[test]
    fn mismatched_hash_blocks_queryability() {
        let store = fully_linked();
        write_obs(&store, ObsSection::Context, "2026-01-01T00:01:00Z", "other");
        let lineage = evaluate_frame(&store, FRAME_ID, &complete_frame()).unwrap();
        assert!(!lineage.queryable);
        assert_eq!(lineage.issues, vec!["obs_context_mismatch"]);
    }

    #[test]
    fn drift_over_limit_is_stale() {
        let store = fully_linked();
        write_obs(&store, ObsSection::Operable, "2026-01-01T00:10:01Z", "h1");
        let lineage = evaluate_frame(&store, FRAME_ID, &complete_frame()).unwrap();
        assert_eq!(lineage.issues, vec!["obs_operable_stale"]);

        write_obs(&store, ObsSection::Operable, "2026-01-01T00:10:00Z", "h1");
        assert!(evaluate_frame(&store, FRAME_ID, &complete_frame()).unwrap().queryable);
    }

    #[test]
    fn unparseable_timestamps_skip_drift_check() {
        let store = fully_linked();
        write_obs(&store, ObsSection::Focus, "not a time", "h1");
        assert!(evaluate_frame(&store, FRAME_ID, &complete_frame()).unwrap().queryable);
    }

    #[test]
    fn missing_everything_lists_each_issue() {
        let store = InMemoryStore::new();
        let lineage = evaluate_frame(&store, FRAME_ID, &complete_frame()).unwrap();
        assert_eq!(
            lineage.issues,
            vec![
                "stage1_marker_missing",
                "retention_marker_missing",
                "obs_focus_missing",
                "obs_context_missing",
                "obs_operable_missing",
            ]
        );
        assert!(!lineage.stage1_contract_ok());
    }

    #[test]
    fn legacy_retention_marker_is_not_validated() {
        let store = fully_linked();
        store
            .put(
                &retention::marker_id(FRAME_ID),
                &json!({"record_type": "retention.eligible", "source_record_id": FRAME_ID, "eligible": true}),
            )
            .unwrap();
        let lineage = evaluate_frame(&store, FRAME_ID, &complete_frame()).unwrap();
        assert!(!lineage.queryable);
        assert_eq!(lineage.issues, vec!["retention_not_validated"]);
    }

    #[test]
    fn tampered_stage1_marker_is_invalid() {
        let store = fully_linked();
        let id = stage1::marker_id(FRAME_ID);
        let mut payload = store.get(&id).unwrap().unwrap();
        payload["uia_record_id"] = json!("U9");
        store.put(&id, &payload).unwrap();
        let lineage = evaluate_frame(&store, FRAME_ID, &complete_frame()).unwrap();
        assert!(lineage.issues.contains(&"stage1_marker_invalid".to_string()));
    }

    #[test]
    fn frame_without_uia_ref_needs_no_observations() {
        let store = InMemoryStore::new();
        let mut frame = complete_frame();
        frame.uia_ref = None;
        let lineage = evaluate_frame(&store, FRAME_ID, &frame).unwrap();
        assert!(!lineage.uia_required);
        assert!(lineage.observation_ok);
        assert!(lineage.issues.contains(&"stage1_incomplete".to_string()));
    }
}
