//! UIA observation documents.
//!
//! Each frame with a `uia_ref` gets three observation documents (focus path,
//! context peers, operable elements), derived from the linked UI-automation
//! snapshot. Snapshot resolution is metadata-first. The fallback file
//! `<data_root>/uia/latest.snap.json` is consulted only when the metadata
//! lookup found nothing; a snapshot that exists but is wrong is never
//! replaced by the fallback. The fallback additionally needs a sidecar
//! `latest.snap.json.sha256` matching its bytes.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::UiaObservationConfig;
use crate::error::StoreError;
use crate::hashing::{canonical_json, hashed_id, run_id_of, sha256_hex, sha256_text};
use crate::record::{
    FrameRecord, ObsNode, ObsSection, ObservationDocument, Record, UiaNode, UiaSnapshot,
};
use crate::store::RecordStore;

pub const FALLBACK_SNAPSHOT_PATH: &str = "uia/latest.snap.json";

const MAX_TEXT_CHARS: usize = 256;

/// Deterministic id of the observation document for one (frame, section).
#[must_use]
pub fn obs_doc_id(frame_id: &str, section: ObsSection, uia_record_id: &str, uia_content_hash: &str) -> String {
    let seed = format!("{frame_id}|{}|{uia_record_id}|{uia_content_hash}", section.name());
    hashed_id(run_id_of(frame_id), section.record_type(), &seed)
}

/// The three ids a linked frame must end up with.
#[must_use]
pub fn expected_ids(frame_id: &str, uia_record_id: &str, uia_content_hash: &str) -> Vec<String> {
    ObsSection::ALL
        .iter()
        .map(|s| obs_doc_id(frame_id, *s, uia_record_id, uia_content_hash))
        .collect()
}

// ── Snapshot resolution ─────────────────────────────────────────────────────

/// Outcome of the metadata-layer lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotLookup {
    Found(UiaSnapshot),
    NotFound,
    /// A record exists at the id but cannot be used
    FoundInvalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Metadata,
    Fallback,
    None,
}

pub fn lookup_snapshot(
    store: &dyn RecordStore,
    uia_record_id: &str,
    uia_content_hash: &str,
) -> Result<SnapshotLookup, StoreError> {
    let Some(payload) = store.get(uia_record_id)? else {
        return Ok(SnapshotLookup::NotFound);
    };
    let snapshot = match Record::decode(&payload) {
        Ok(Record::UiaSnapshot(snapshot)) => snapshot,
        Ok(_) => return Ok(SnapshotLookup::FoundInvalid("not_a_uia_snapshot".to_string())),
        Err(e) => return Ok(SnapshotLookup::FoundInvalid(e.to_string())),
    };
    if snapshot.content_hash != uia_content_hash {
        return Ok(SnapshotLookup::FoundInvalid("content_hash_mismatch".to_string()));
    }
    Ok(SnapshotLookup::Found(snapshot))
}

#[must_use]
pub fn fallback_paths(data_root: &Path) -> (PathBuf, PathBuf) {
    let snapshot = data_root.join(FALLBACK_SNAPSHOT_PATH);
    let sidecar = data_root.join(format!("{FALLBACK_SNAPSHOT_PATH}.sha256"));
    (snapshot, sidecar)
}

/// Load and verify the fallback snapshot. The sidecar hash is always
/// required; `require_hash_match` additionally pins the snapshot's
/// `content_hash` to the frame's.
pub fn load_fallback(
    data_root: &Path,
    expected_content_hash: &str,
    require_hash_match: bool,
) -> Result<UiaSnapshot, String> {
    let (snapshot_path, sidecar_path) = fallback_paths(data_root);
    let bytes = fs::read(&snapshot_path).map_err(|_| "fallback_missing".to_string())?;
    let sidecar = fs::read_to_string(&sidecar_path).map_err(|_| "fallback_hash_missing".to_string())?;
    let declared = sidecar
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if declared.is_empty() || declared != sha256_hex(&bytes) {
        return Err("fallback_hash_mismatch".to_string());
    }
    let snapshot: UiaSnapshot =
        serde_json::from_slice(&bytes).map_err(|e| format!("fallback_unparseable: {e}"))?;
    if snapshot.content_hash.trim().is_empty() {
        return Err("fallback_content_hash_missing".to_string());
    }
    if require_hash_match && snapshot.content_hash != expected_content_hash {
        return Err("fallback_content_hash_mismatch".to_string());
    }
    Ok(snapshot)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSnapshot {
    pub snapshot: Option<UiaSnapshot>,
    pub source: SnapshotSource,
    pub reason: Option<String>,
}

/// Metadata first; fallback only from `NotFound`.
pub fn load_snapshot(
    store: &dyn RecordStore,
    data_root: Option<&Path>,
    uia_record_id: &str,
    uia_content_hash: &str,
    config: &UiaObservationConfig,
) -> Result<ResolvedSnapshot, StoreError> {
    let resolved = match lookup_snapshot(store, uia_record_id, uia_content_hash)? {
        SnapshotLookup::Found(snapshot) => ResolvedSnapshot {
            snapshot: Some(snapshot),
            source: SnapshotSource::Metadata,
            reason: None,
        },
        SnapshotLookup::FoundInvalid(reason) => ResolvedSnapshot {
            snapshot: None,
            source: SnapshotSource::Metadata,
            reason: Some(format!("snapshot_invalid: {reason}")),
        },
        SnapshotLookup::NotFound => match data_root.filter(|_| config.fallback_enabled) {
            None => ResolvedSnapshot {
                snapshot: None,
                source: SnapshotSource::None,
                reason: Some("snapshot_missing".to_string()),
            },
            Some(root) => match load_fallback(root, uia_content_hash, config.require_hash_match) {
                Ok(snapshot) => ResolvedSnapshot {
                    snapshot: Some(snapshot),
                    source: SnapshotSource::Fallback,
                    reason: None,
                },
                Err(reason) => ResolvedSnapshot {
                    snapshot: None,
                    source: SnapshotSource::None,
                    reason: Some(reason),
                },
            },
        },
    };
    Ok(resolved)
}

// ── Materialisation ─────────────────────────────────────────────────────────

fn truncate(text: Option<&str>) -> Option<String> {
    let text = text?.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.chars().take(MAX_TEXT_CHARS).collect())
}

/// Clamp `[left, top, right, bottom]` to the frame; `None` for degenerate or
/// non-finite boxes.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn clamp_bbox(rect: [f64; 4], width: Option<u32>, height: Option<u32>) -> Option<[i64; 4]> {
    if rect.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let [mut left, mut top, mut right, mut bottom] = rect;
    if left > right {
        std::mem::swap(&mut left, &mut right);
    }
    if top > bottom {
        std::mem::swap(&mut top, &mut bottom);
    }
    let max_x = width.map_or(f64::MAX, f64::from);
    let max_y = height.map_or(f64::MAX, f64::from);
    let clamp = |v: f64, max: f64| v.clamp(0.0, max).round() as i64;
    let bbox = [clamp(left, max_x), clamp(top, max_y), clamp(right, max_x), clamp(bottom, max_y)];
    (bbox[2] > bbox[0] && bbox[3] > bbox[1]).then_some(bbox)
}

fn node_limit(section: ObsSection, config: &UiaObservationConfig) -> usize {
    match section {
        ObsSection::Focus => config.max_focus_nodes,
        ObsSection::Context => config.max_context_nodes,
        ObsSection::Operable => config.max_operable_nodes,
    }
}

fn normalise_node(node: &UiaNode, frame: &FrameRecord) -> ObsNode {
    ObsNode {
        eid: truncate(node.eid.as_deref()),
        role: truncate(node.role.as_deref()),
        name: truncate(node.name.as_deref()),
        value: truncate(node.value.as_deref()),
        bbox: node.rect.and_then(|r| clamp_bbox(r, frame.width, frame.height)),
    }
}

/// Build the observation documents for a frame. Empty sections produce no
/// document.
#[must_use]
pub fn materialize(
    frame_id: &str,
    frame: &FrameRecord,
    snapshot: &UiaSnapshot,
    uia_record_id: &str,
    uia_content_hash: &str,
    config: &UiaObservationConfig,
) -> Vec<(String, Value)> {
    let window = snapshot.window.clone().unwrap_or_default();
    let mut docs = Vec::new();
    for section in ObsSection::ALL {
        let nodes: Vec<ObsNode> = snapshot
            .section(section)
            .iter()
            .filter(|n| n.offscreen != Some(true) || section != ObsSection::Operable)
            .take(node_limit(section, config))
            .map(|n| normalise_node(n, frame))
            .collect();
        if nodes.is_empty() {
            continue;
        }
        let bboxes = nodes.iter().filter_map(|n| n.bbox).collect();
        let nodes_value = serde_json::to_value(&nodes).unwrap_or(Value::Null);
        let doc = ObservationDocument {
            record_type: section.record_type().to_string(),
            run_id: Some(run_id_of(frame_id).to_string()),
            ts_utc: snapshot.ts_utc.clone().or_else(|| frame.ts_utc.clone()),
            source_record_id: frame_id.to_string(),
            uia_record_id: uia_record_id.to_string(),
            uia_content_hash: uia_content_hash.to_string(),
            hwnd: window.hwnd.clone(),
            window_title: window.title.clone(),
            window_pid: window.pid,
            nodes,
            bboxes,
            content_hash: Some(sha256_text(&canonical_json(&nodes_value))),
        };
        let id = obs_doc_id(frame_id, section, uia_record_id, uia_content_hash);
        match serde_json::to_value(&doc) {
            Ok(value) => docs.push((id, value)),
            Err(e) => warn!(frame_id, section = section.name(), error = %e, "Observation doc not serializable"),
        }
    }
    docs
}

/// Outcome of materialising one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UiaResult {
    /// The frame carries a `uia_ref`
    pub required: bool,
    /// All expected documents exist after the pass
    pub ok: bool,
    pub expected_ids: Vec<String>,
    pub inserted: usize,
    pub source: SnapshotSource,
    pub reason: String,
}

impl UiaResult {
    fn not_required() -> Self {
        Self {
            required: false,
            ok: true,
            expected_ids: Vec::new(),
            inserted: 0,
            source: SnapshotSource::None,
            reason: "no_uia_ref".to_string(),
        }
    }
}

fn all_present(store: &dyn RecordStore, ids: &[String]) -> Result<bool, StoreError> {
    for id in ids {
        if !store.contains(id)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Ensure the three observation documents for a frame exist.
pub fn materialize_for_frame(
    store: &dyn RecordStore,
    data_root: Option<&Path>,
    frame_id: &str,
    frame: &FrameRecord,
    config: &UiaObservationConfig,
    dry_run: bool,
) -> Result<UiaResult, StoreError> {
    if !frame.has_uia_ref() {
        return Ok(UiaResult::not_required());
    }
    let Some((uia_record_id, uia_content_hash)) = frame.linked_uia() else {
        return Ok(UiaResult {
            required: true,
            ok: false,
            expected_ids: Vec::new(),
            inserted: 0,
            source: SnapshotSource::None,
            reason: "uia_ref_incomplete".to_string(),
        });
    };
    let expected = expected_ids(frame_id, uia_record_id, uia_content_hash);
    if all_present(store, &expected)? {
        return Ok(UiaResult {
            required: true,
            ok: true,
            expected_ids: expected,
            inserted: 0,
            source: SnapshotSource::None,
            reason: "already_present".to_string(),
        });
    }

    let resolved = load_snapshot(store, data_root, uia_record_id, uia_content_hash, config)?;
    let Some(snapshot) = resolved.snapshot else {
        let reason = resolved.reason.unwrap_or_else(|| "snapshot_missing".to_string());
        debug!(frame_id, reason = %reason, "UIA snapshot unavailable");
        return Ok(UiaResult {
            required: true,
            ok: false,
            expected_ids: expected,
            inserted: 0,
            source: resolved.source,
            reason,
        });
    };

    let docs = materialize(frame_id, frame, &snapshot, uia_record_id, uia_content_hash, config);
    let mut inserted = 0;
    let mut failed = false;
    for (id, doc) in &docs {
        if dry_run {
            if !store.contains(id)? {
                inserted += 1;
            }
            continue;
        }
        match store.insert_if_absent(id, doc) {
            Ok(true) => inserted += 1,
            Ok(false) => {}
            Err(e) => {
                failed = true;
                warn!(frame_id, record_id = %id, error = %e, "Observation doc write failed");
            }
        }
    }

    let ok = if dry_run {
        docs.len() == expected.len()
    } else {
        all_present(store, &expected)?
    };
    let reason = if failed {
        "insert_failed"
    } else if ok {
        "ok"
    } else {
        "sections_empty"
    };
    Ok(UiaResult {
        required: true,
        ok,
        expected_ids: expected,
        inserted,
        source: resolved.source,
        reason: reason.to_string(),
    })
}

/// Observation documents present for a frame, keyed by section.
pub fn load_observations(
    store: &dyn RecordStore,
    frame_id: &str,
    frame: &FrameRecord,
) -> Result<Vec<(ObsSection, ObservationDocument)>, StoreError> {
    let Some((uia_record_id, uia_content_hash)) = frame.linked_uia() else {
        return Ok(Vec::new());
    };
    let mut docs = Vec::new();
    for section in ObsSection::ALL {
        let id = obs_doc_id(frame_id, section, uia_record_id, uia_content_hash);
        if let Some(payload) = store.get(&id)? {
            if let Ok(Record::Observation(found, doc)) = Record::decode(&payload) {
                if found == section {
                    docs.push((section, doc));
                }
            }
        }
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UIA_SNAPSHOT;
    use crate::stage1::tests::complete_frame;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use tempfile::TempDir;

    const FRAME_ID: &str = "run1/evidence.capture.frame/1";

    fn snapshot_payload(hash: &str, populated: bool) -> Value {
        let nodes = if populated {
            json!([{"eid": "e1", "role": "button", "name": "Save", "rect": [10.0, 10.0, 50.0, 30.0]}])
        } else {
            json!([])
        };
        json!({
            "record_type": UIA_SNAPSHOT,
            "record_id": "U1",
            "content_hash": hash,
            "ts_utc": "2026-01-01T00:00:05Z",
            "window": {"hwnd": 42, "title": "Editor", "pid": 7},
            "focus_path": nodes,
            "context_peers": nodes,
            "operable": nodes,
        })
    }

    #[test]
    fn frame_without_uia_is_not_required() {
        let store = InMemoryStore::new();
        let mut frame = complete_frame();
        frame.uia_ref = None;
        let result =
            materialize_for_frame(&store, None, FRAME_ID, &frame, &UiaObservationConfig::default(), false)
                .unwrap();
        assert!(!result.required);
        assert!(result.ok);
    }

    #[test]
    fn populated_snapshot_yields_three_docs() {
        let store = InMemoryStore::new();
        store.put("U1", &snapshot_payload("h1", true)).unwrap();
        let config = UiaObservationConfig::default();
        let result = materialize_for_frame(&store, None, FRAME_ID, &complete_frame(), &config, false).unwrap();
        assert!(result.ok);
        assert_eq!(result.inserted, 3);
        assert_eq!(result.source, SnapshotSource::Metadata);

        let again = materialize_for_frame(&store, None, FRAME_ID, &complete_frame(), &config, false).unwrap();
        assert!(again.ok);
        assert_eq!(again.inserted, 0);
        assert_eq!(again.reason, "already_present");
    }

    #[test]
    fn empty_sections_leave_frame_blocked() {
        let store = InMemoryStore::new();
        store.put("U1", &snapshot_payload("h1", false)).unwrap();
        let result = materialize_for_frame(
            &store,
            None,
            FRAME_ID,
            &complete_frame(),
            &UiaObservationConfig::default(),
            false,
        )
        .unwrap();
        assert!(result.required);
        assert!(!result.ok);
        assert_eq!(result.inserted, 0);
        assert_eq!(result.reason, "sections_empty");
    }

    #[test]
    fn present_but_wrong_snapshot_never_uses_fallback() {
        let root = TempDir::new().unwrap();
        write_fallback(root.path(), &snapshot_payload("h1", true), true);
        let store = InMemoryStore::new();
        store.put("U1", &snapshot_payload("other", true)).unwrap();
        let resolved =
            load_snapshot(&store, Some(root.path()), "U1", "h1", &UiaObservationConfig::default()).unwrap();
        assert!(resolved.snapshot.is_none());
        assert_eq!(resolved.source, SnapshotSource::Metadata);
        assert_eq!(resolved.reason.as_deref(), Some("snapshot_invalid: content_hash_mismatch"));
    }

    fn write_fallback(root: &Path, payload: &Value, with_sidecar: bool) {
        let (path, sidecar) = fallback_paths(root);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let bytes = serde_json::to_vec(payload).unwrap();
        fs::write(&path, &bytes).unwrap();
        if with_sidecar {
            fs::write(&sidecar, format!("{}  latest.snap.json\n", sha256_hex(&bytes))).unwrap();
        }
    }

    #[test]
    fn fallback_used_only_when_not_found() {
        let root = TempDir::new().unwrap();
        write_fallback(root.path(), &snapshot_payload("h1", true), true);
        let store = InMemoryStore::new();
        let resolved =
            load_snapshot(&store, Some(root.path()), "U1", "h1", &UiaObservationConfig::default()).unwrap();
        assert_eq!(resolved.source, SnapshotSource::Fallback);
        assert!(resolved.snapshot.is_some());
    }

    #[test]
    fn fallback_requires_sidecar_even_without_hash_match() {
        let root = TempDir::new().unwrap();
        write_fallback(root.path(), &snapshot_payload("h1", true), false);
        assert_eq!(
            load_fallback(root.path(), "h1", false).unwrap_err(),
            "fallback_hash_missing"
        );
    }

    #[test]
    fn fallback_rejects_tampered_bytes_and_foreign_hash() {
        let root = TempDir::new().unwrap();
        write_fallback(root.path(), &snapshot_payload("h2", true), true);
        assert_eq!(
            load_fallback(root.path(), "h1", true).unwrap_err(),
            "fallback_content_hash_mismatch"
        );
        assert!(load_fallback(root.path(), "h1", false).is_ok());

        let (path, _) = fallback_paths(root.path());
        fs::write(&path, b"{}").unwrap();
        assert_eq!(
            load_fallback(root.path(), "h1", false).unwrap_err(),
            "fallback_hash_mismatch"
        );
    }

    #[test]
    fn bboxes_are_clamped_to_frame() {
        assert_eq!(clamp_bbox([-5.0, 10.0, 3000.0, 20.4], Some(1920), Some(1080)), Some([0, 10, 1920, 20]));
        assert_eq!(clamp_bbox([50.0, 50.0, 10.0, 10.0], None, None), Some([10, 10, 50, 50]));
        assert_eq!(clamp_bbox([5.0, 5.0, 5.0, 9.0], None, None), None);
        assert_eq!(clamp_bbox([f64::NAN, 0.0, 1.0, 1.0], None, None), None);
    }

    #[test]
    fn node_count_is_bounded() {
        let nodes: Vec<Value> = (0..10).map(|i| json!({"eid": format!("e{i}"), "name": "n"})).collect();
        let snapshot: UiaSnapshot = serde_json::from_value(json!({
            "content_hash": "h1",
            "focus_path": nodes,
        }))
        .unwrap();
        let config = UiaObservationConfig {
            max_focus_nodes: 4,
            ..UiaObservationConfig::default()
        };
        let docs = materialize(FRAME_ID, &complete_frame(), &snapshot, "U1", "h1", &config);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].1["nodes"].as_array().unwrap().len(), 4);
        assert_eq!(docs[0].1["record_type"], "obs.uia.focus");
    }

    #[test]
    fn doc_ids_are_deterministic_per_section() {
        let a = obs_doc_id(FRAME_ID, ObsSection::Focus, "U1", "h1");
        assert_eq!(a, obs_doc_id(FRAME_ID, ObsSection::Focus, "U1", "h1"));
        assert_ne!(a, obs_doc_id(FRAME_ID, ObsSection::Context, "U1", "h1"));
        assert_ne!(a, obs_doc_id(FRAME_ID, ObsSection::Focus, "U1", "h2"));
        assert!(a.starts_with("run1/obs.uia.focus/"));
    }
}
