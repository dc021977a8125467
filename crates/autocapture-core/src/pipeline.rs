//! Per-frame completion pipeline.
//!
//! Order matters: UIA observations, Stage2 projection, Stage1 marker, then
//! the retention marker. Retention is written only after the Stage1 marker
//! exists, and its `stage1_contract_validated` flag comes from the same
//! lineage evaluation the auditor uses.

use std::path::Path;

use serde::Serialize;

use crate::config::UiaObservationConfig;
use crate::error::StoreError;
use crate::lineage;
use crate::record::FrameRecord;
use crate::retention;
use crate::stage1;
use crate::stage2::{self, Stage2Result};
use crate::store::RecordStore;
use crate::uia::{self, UiaResult};

/// Everything a pipeline pass needs, owned by the caller.
#[derive(Clone, Copy)]
pub struct PipelineContext<'a> {
    pub store: &'a dyn RecordStore,
    /// Data root for the fallback UIA snapshot
    pub data_root: Option<&'a Path>,
    pub uia: &'a UiaObservationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameOutcome {
    pub frame_id: String,
    pub uia: UiaResult,
    pub stage2: Stage2Result,
    pub stage1_complete: bool,
    pub stage1_marker: Option<String>,
    pub retention_marker: Option<String>,
    /// Value written to `stage1_contract_validated`
    pub retention_validated: bool,
    pub queryable: bool,
}

/// Drive one frame through every stage.
pub fn process_frame(ctx: &PipelineContext<'_>, frame_id: &str, frame: &FrameRecord) -> Result<FrameOutcome, StoreError> {
    let uia = uia::materialize_for_frame(ctx.store, ctx.data_root, frame_id, frame, ctx.uia, false)?;
    let stage2 = stage2::project_frame(ctx.store, frame_id, frame, false)?;
    let stage1_complete = stage1::is_complete(frame);
    let stage1_marker = stage1::mark_complete(ctx.store, frame_id, frame);

    let mut retention_marker = None;
    let mut retention_validated = false;
    let mut queryable = false;
    if stage1_marker.is_some() && (!uia.required || uia.ok) {
        let lineage = lineage::evaluate_frame(ctx.store, frame_id, frame)?;
        retention_validated = lineage.stage1_contract_ok();
        retention_marker = retention::mark_eligible(ctx.store, frame_id, frame, retention_validated);
        if retention_marker.is_some() {
            queryable = lineage::evaluate_frame(ctx.store, frame_id, frame)?.queryable;
        }
    }

    Ok(FrameOutcome {
        frame_id: frame_id.to_string(),
        uia,
        stage2,
        stage1_complete,
        stage1_marker,
        retention_marker,
        retention_validated,
        queryable,
    })
}

/// Counters accumulated over many frames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounts {
    pub frames: usize,
    pub stage1_complete: usize,
    pub stage1_marked: usize,
    pub retention_marked: usize,
    pub retention_validated: usize,
    /// Stage1-complete frames left without a retention marker
    pub stage1_missing_retention_marker: usize,
    /// Frames whose UIA observations are required but incomplete
    pub uia_frames_missing: usize,
    pub uia_docs_inserted: usize,
    pub stage2_docs_inserted: usize,
    pub stage2_states_inserted: usize,
    pub stage2_errors: usize,
    pub queryable: usize,
}

impl PipelineCounts {
    pub fn record(&mut self, outcome: &FrameOutcome) {
        self.frames += 1;
        self.stage1_complete += usize::from(outcome.stage1_complete);
        self.stage1_marked += usize::from(outcome.stage1_marker.is_some());
        self.retention_marked += usize::from(outcome.retention_marker.is_some());
        self.retention_validated += usize::from(outcome.retention_marker.is_some() && outcome.retention_validated);
        self.stage1_missing_retention_marker +=
            usize::from(outcome.stage1_complete && outcome.retention_marker.is_none());
        self.uia_frames_missing += usize::from(outcome.uia.required && !outcome.uia.ok);
        self.uia_docs_inserted += outcome.uia.inserted;
        self.stage2_docs_inserted += outcome.stage2.inserted_docs;
        self.stage2_states_inserted += outcome.stage2.inserted_states;
        self.stage2_errors += outcome.stage2.errors.len();
        self.queryable += usize::from(outcome.queryable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UIA_SNAPSHOT;
    use crate::stage1::tests::complete_frame;
    use crate::store::InMemoryStore;
    use serde_json::json;

    const FRAME_ID: &str = "run1/evidence.capture.frame/1";

    fn snapshot(populated: bool) -> serde_json::Value {
        let nodes = if populated {
            json!([{"role": "button", "name": "Save", "rect": [0.0, 0.0, 10.0, 10.0]}])
        } else {
            json!([])
        };
        json!({
            "record_type": UIA_SNAPSHOT,
            "content_hash": "h1",
            "ts_utc": "2026-01-01T00:00:01Z",
            "focus_path": nodes,
            "context_peers": nodes,
            "operable": nodes,
        })
    }

    #[test]
    fn empty_snapshot_blocks_retention_until_populated() {
        let store = InMemoryStore::new();
        store.put("U1", &snapshot(false)).unwrap();
        let config = UiaObservationConfig::default();
        let ctx = PipelineContext {
            store: &store,
            data_root: None,
            uia: &config,
        };

        let first = process_frame(&ctx, FRAME_ID, &complete_frame()).unwrap();
        assert!(first.stage1_marker.is_some());
        assert!(first.retention_marker.is_none());
        assert!(!first.queryable);

        store.put("U1", &snapshot(true)).unwrap();
        let second = process_frame(&ctx, FRAME_ID, &complete_frame()).unwrap();
        assert!(second.uia.ok);
        assert!(second.retention_validated);
        assert!(second.queryable);

        let mut counts = PipelineCounts::default();
        counts.record(&first);
        counts.record(&second);
        assert_eq!(counts.frames, 2);
        assert_eq!(counts.stage1_missing_retention_marker, 1);
        assert_eq!(counts.uia_frames_missing, 1);
        assert_eq!(counts.queryable, 1);
    }

    #[test]
    fn frame_without_uia_ref_gets_no_markers() {
        let store = InMemoryStore::new();
        let mut frame = complete_frame();
        frame.uia_ref = None;
        let config = UiaObservationConfig::default();
        let ctx = PipelineContext {
            store: &store,
            data_root: None,
            uia: &config,
        };
        let outcome = process_frame(&ctx, FRAME_ID, &frame).unwrap();
        assert!(!outcome.stage1_complete);
        assert!(outcome.stage1_marker.is_none());
        assert!(outcome.retention_marker.is_none());
    }
}
