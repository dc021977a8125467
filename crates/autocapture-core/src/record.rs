//! Record model: one closed sum type over every record type the engine reads
//! or writes.
//!
//! Stores hand out raw JSON payloads; [`Record::decode`] turns them into typed
//! variants and rejects payloads whose required fields are absent or empty.
//! Frame linkage fields stay optional because Stage1 exists to evaluate
//! exactly their presence.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RecordError;

pub const FRAME: &str = "evidence.capture.frame";
pub const UIA_SNAPSHOT: &str = "evidence.uia.snapshot";
pub const INPUT_FILE: &str = "evidence.input.file";
pub const OBS_FOCUS: &str = "obs.uia.focus";
pub const OBS_CONTEXT: &str = "obs.uia.context";
pub const OBS_OPERABLE: &str = "obs.uia.operable";
pub const STAGE1_COMPLETE: &str = "derived.ingest.stage1.complete";
pub const STAGE2_COMPLETE: &str = "derived.ingest.stage2.complete";
pub const RETENTION_ELIGIBLE: &str = "retention.eligible";
pub const SST_TEXT_EXTRA: &str = "derived.sst.text.extra";
pub const SST_STATE: &str = "derived.sst.state";
pub const RETENTION_BATCH: &str = "derived.retention.batch";
pub const HANDOFF_COMPLETED: &str = "system.ingest.handoff.completed";

/// Prefix shared by raw capture evidence types.
pub const EVIDENCE_PREFIX: &str = "evidence.";

/// Parse an RFC 3339 timestamp into UTC.
#[must_use]
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Format a timestamp the way every derived record stores it.
#[must_use]
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `record_type` field of a raw payload.
#[must_use]
pub fn record_type_of(payload: &Value) -> Option<&str> {
    payload.get("record_type").and_then(Value::as_str)
}

/// `ts_utc` of a raw payload, parsed.
#[must_use]
pub fn ts_of(payload: &Value) -> Option<DateTime<Utc>> {
    payload.get("ts_utc").and_then(Value::as_str).and_then(parse_ts)
}

/// One of the three observation sections derived from a UIA snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObsSection {
    Focus,
    Context,
    Operable,
}

impl ObsSection {
    pub const ALL: [Self; 3] = [Self::Focus, Self::Context, Self::Operable];

    #[must_use]
    pub const fn record_type(self) -> &'static str {
        match self {
            Self::Focus => OBS_FOCUS,
            Self::Context => OBS_CONTEXT,
            Self::Operable => OBS_OPERABLE,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Focus => "focus",
            Self::Context => "context",
            Self::Operable => "operable",
        }
    }
}

/// Link from a frame to the UIA snapshot captured with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiaRef {
    pub record_id: Option<String>,
    pub content_hash: Option<String>,
}

impl UiaRef {
    /// Both halves present and non-empty.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        non_empty(self.record_id.as_deref()) && non_empty(self.content_hash.as_deref())
    }
}

/// Link from a frame to the input record (or input batch) that accompanied it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputRef {
    pub record_id: Option<String>,
}

/// One captured screen image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameRecord {
    pub record_type: String,
    pub run_id: Option<String>,
    pub ts_utc: Option<String>,
    pub content_hash: Option<String>,
    pub blob_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub window_title: Option<String>,
    pub uia_ref: Option<UiaRef>,
    pub input_ref: Option<InputRef>,
    pub input_batch_ref: Option<InputRef>,
}

impl FrameRecord {
    #[must_use]
    pub fn ts(&self) -> Option<DateTime<Utc>> {
        self.ts_utc.as_deref().and_then(parse_ts)
    }

    /// The UIA reference, only when it is fully linked.
    #[must_use]
    pub fn linked_uia(&self) -> Option<(&str, &str)> {
        let uia = self.uia_ref.as_ref()?;
        match (uia.record_id.as_deref(), uia.content_hash.as_deref()) {
            (Some(id), Some(hash)) if !id.is_empty() && !hash.is_empty() => Some((id, hash)),
            _ => None,
        }
    }

    /// Whether the frame carries any UIA reference at all, complete or not.
    #[must_use]
    pub fn has_uia_ref(&self) -> bool {
        self.uia_ref
            .as_ref()
            .is_some_and(|uia| uia.record_id.is_some() || uia.content_hash.is_some())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiaWindow {
    pub hwnd: Option<Value>,
    pub title: Option<String>,
    pub pid: Option<u64>,
    pub app: Option<String>,
}

/// One UI-automation element. `rect` is `[left, top, right, bottom]` in
/// screen pixels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiaNode {
    pub eid: Option<String>,
    pub role: Option<String>,
    pub name: Option<String>,
    pub value: Option<String>,
    pub rect: Option<[f64; 4]>,
    pub enabled: Option<bool>,
    pub offscreen: Option<bool>,
}

/// A UI-automation tree snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiaSnapshot {
    pub record_type: String,
    pub record_id: Option<String>,
    pub content_hash: String,
    pub ts_utc: Option<String>,
    pub window: Option<UiaWindow>,
    pub focus_path: Vec<UiaNode>,
    pub context_peers: Vec<UiaNode>,
    pub operable: Vec<UiaNode>,
}

impl UiaSnapshot {
    #[must_use]
    pub fn section(&self, section: ObsSection) -> &[UiaNode] {
        match section {
            ObsSection::Focus => &self.focus_path,
            ObsSection::Context => &self.context_peers,
            ObsSection::Operable => &self.operable,
        }
    }
}

/// Bounded node summary stored in an observation document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObsNode {
    pub eid: Option<String>,
    pub role: Option<String>,
    pub name: Option<String>,
    pub value: Option<String>,
    pub bbox: Option<[i64; 4]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationDocument {
    pub record_type: String,
    pub run_id: Option<String>,
    pub ts_utc: Option<String>,
    pub source_record_id: String,
    pub uia_record_id: String,
    pub uia_content_hash: String,
    pub hwnd: Option<Value>,
    pub window_title: Option<String>,
    pub window_pid: Option<u64>,
    pub nodes: Vec<ObsNode>,
    pub bboxes: Vec<[i64; 4]>,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage1Marker {
    pub record_type: String,
    pub ts_utc: Option<String>,
    pub source_record_id: String,
    pub source_record_type: Option<String>,
    pub complete: bool,
    pub uia_record_id: Option<String>,
    pub uia_content_hash: Option<String>,
    pub payload_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage2Marker {
    pub record_type: String,
    pub source_record_id: String,
    pub complete: bool,
    pub generated_docs: u64,
    pub inserted_docs: u64,
    pub generated_states: u64,
    pub inserted_states: u64,
}

/// Retention eligibility. `stage1_contract_validated` is `None` on the legacy
/// shape, which is never treated as validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionMarker {
    pub record_type: String,
    pub ts_utc: Option<String>,
    pub source_record_id: String,
    pub source_record_type: Option<String>,
    pub eligible: Option<bool>,
    pub stage1_contract_validated: Option<bool>,
    pub quarantine_pending: Option<bool>,
    pub stage1_record_id: Option<String>,
    pub payload_hash: Option<String>,
}

impl RetentionMarker {
    #[must_use]
    pub fn is_validated(&self) -> bool {
        self.stage1_contract_validated == Some(true)
            && self.quarantine_pending != Some(true)
            && self.eligible != Some(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionDocument {
    pub record_type: String,
    pub source_record_id: String,
    pub doc_kind: String,
    pub text: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenStateRecord {
    pub record_type: String,
    pub frame_id: String,
    pub tokens: Vec<String>,
    pub element_graph: Value,
    pub visible_apps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionBatchRecord {
    pub record_type: String,
    pub cutoff_ts_utc: String,
    pub deleted_ids: Vec<String>,
    /// Records whose blob was already gone
    pub missing_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffCompletionRecord {
    pub record_type: String,
    pub handoff_hash: String,
    pub counts: Value,
}

/// Every record type the engine interprets, plus a catch-all.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Frame(FrameRecord),
    UiaSnapshot(UiaSnapshot),
    Observation(ObsSection, ObservationDocument),
    Stage1(Stage1Marker),
    Stage2(Stage2Marker),
    Retention(RetentionMarker),
    ProjectionDoc(ProjectionDocument),
    ScreenState(ScreenStateRecord),
    RetentionBatch(RetentionBatchRecord),
    HandoffCompleted(HandoffCompletionRecord),
    Other { record_type: String, payload: Value },
}

fn non_empty(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

fn require(record_type: &str, field: &'static str, value: &str) -> Result<(), RecordError> {
    if value.trim().is_empty() {
        return Err(RecordError::MissingField {
            record_type: record_type.to_string(),
            field,
        });
    }
    Ok(())
}

fn decode_as<T: for<'de> Deserialize<'de>>(record_type: &str, payload: &Value) -> Result<T, RecordError> {
    serde_json::from_value(payload.clone()).map_err(|err| RecordError::Decode {
        record_type: record_type.to_string(),
        detail: err.to_string(),
    })
}

impl Record {
    /// Decode a raw payload, enforcing required fields per record type.
    pub fn decode(payload: &Value) -> Result<Self, RecordError> {
        if !payload.is_object() {
            return Err(RecordError::NotAnObject);
        }
        let record_type = record_type_of(payload)
            .filter(|rt| !rt.is_empty())
            .ok_or(RecordError::MissingRecordType)?;

        let record = match record_type {
            FRAME => Self::Frame(decode_as(record_type, payload)?),
            UIA_SNAPSHOT => {
                let snapshot: UiaSnapshot = decode_as(record_type, payload)?;
                require(record_type, "content_hash", &snapshot.content_hash)?;
                Self::UiaSnapshot(snapshot)
            }
            OBS_FOCUS | OBS_CONTEXT | OBS_OPERABLE => {
                let section = match record_type {
                    OBS_FOCUS => ObsSection::Focus,
                    OBS_CONTEXT => ObsSection::Context,
                    _ => ObsSection::Operable,
                };
                let doc: ObservationDocument = decode_as(record_type, payload)?;
                require(record_type, "source_record_id", &doc.source_record_id)?;
                require(record_type, "uia_record_id", &doc.uia_record_id)?;
                require(record_type, "uia_content_hash", &doc.uia_content_hash)?;
                Self::Observation(section, doc)
            }
            STAGE1_COMPLETE => {
                let marker: Stage1Marker = decode_as(record_type, payload)?;
                require(record_type, "source_record_id", &marker.source_record_id)?;
                Self::Stage1(marker)
            }
            STAGE2_COMPLETE => {
                let marker: Stage2Marker = decode_as(record_type, payload)?;
                require(record_type, "source_record_id", &marker.source_record_id)?;
                Self::Stage2(marker)
            }
            RETENTION_ELIGIBLE => {
                let marker: RetentionMarker = decode_as(record_type, payload)?;
                require(record_type, "source_record_id", &marker.source_record_id)?;
                Self::Retention(marker)
            }
            SST_TEXT_EXTRA => {
                let doc: ProjectionDocument = decode_as(record_type, payload)?;
                require(record_type, "source_record_id", &doc.source_record_id)?;
                require(record_type, "doc_kind", &doc.doc_kind)?;
                Self::ProjectionDoc(doc)
            }
            SST_STATE => {
                let state: ScreenStateRecord = decode_as(record_type, payload)?;
                require(record_type, "frame_id", &state.frame_id)?;
                Self::ScreenState(state)
            }
            RETENTION_BATCH => {
                let batch: RetentionBatchRecord = decode_as(record_type, payload)?;
                require(record_type, "cutoff_ts_utc", &batch.cutoff_ts_utc)?;
                Self::RetentionBatch(batch)
            }
            HANDOFF_COMPLETED => {
                let done: HandoffCompletionRecord = decode_as(record_type, payload)?;
                require(record_type, "handoff_hash", &done.handoff_hash)?;
                Self::HandoffCompleted(done)
            }
            other => Self::Other {
                record_type: other.to_string(),
                payload: payload.clone(),
            },
        };
        Ok(record)
    }

    /// Decode and require a frame.
    pub fn frame(payload: &Value) -> Result<FrameRecord, RecordError> {
        match Self::decode(payload)? {
            Self::Frame(frame) => Ok(frame),
            _ => Err(RecordError::Decode {
                record_type: record_type_of(payload).unwrap_or_default().to_string(),
                detail: format!("expected {FRAME}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_decodes_with_optional_linkage() {
        let payload = json!({
            "record_type": FRAME,
            "ts_utc": "2026-01-01T00:00:00Z",
            "content_hash": "abc",
            "uia_ref": {"record_id": "U1", "content_hash": "h1"},
        });
        let frame = Record::frame(&payload).unwrap();
        assert_eq!(frame.linked_uia(), Some(("U1", "h1")));
        assert!(frame.blob_path.is_none());
        assert_eq!(format_ts(frame.ts().unwrap()), "2026-01-01T00:00:00Z");
    }

    #[test]
    fn half_linked_uia_is_not_linked() {
        let payload = json!({"record_type": FRAME, "uia_ref": {"record_id": "U1"}});
        let frame = Record::frame(&payload).unwrap();
        assert!(frame.has_uia_ref());
        assert!(frame.linked_uia().is_none());
    }

    #[test]
    fn marker_without_source_is_rejected() {
        let payload = json!({"record_type": STAGE1_COMPLETE, "complete": true});
        assert_eq!(
            Record::decode(&payload).unwrap_err(),
            RecordError::MissingField {
                record_type: STAGE1_COMPLETE.to_string(),
                field: "source_record_id",
            }
        );
    }

    #[test]
    fn observation_requires_uia_linkage_fields() {
        let payload = json!({
            "record_type": OBS_FOCUS,
            "source_record_id": "run/evidence.capture.frame/1",
            "uia_record_id": "U1",
        });
        assert!(matches!(
            Record::decode(&payload),
            Err(RecordError::MissingField { field: "uia_content_hash", .. })
        ));
    }

    #[test]
    fn legacy_retention_marker_is_not_validated() {
        let payload = json!({
            "record_type": RETENTION_ELIGIBLE,
            "source_record_id": "run/evidence.capture.frame/1",
            "eligible": true,
        });
        let Record::Retention(marker) = Record::decode(&payload).unwrap() else {
            panic!("expected retention marker");
        };
        assert!(!marker.is_validated());
    }

    #[test]
    fn unknown_types_are_carried_through() {
        let payload = json!({"record_type": "evidence.input.batch", "n": 3});
        assert!(matches!(Record::decode(&payload), Ok(Record::Other { .. })));
        assert_eq!(
            Record::decode(&json!([1, 2])).unwrap_err(),
            RecordError::NotAnObject
        );
        assert_eq!(
            Record::decode(&json!({"x": 1})).unwrap_err(),
            RecordError::MissingRecordType
        );
    }

    #[test]
    fn timestamps_with_offsets_normalise_to_utc() {
        let ts = parse_ts("2026-01-01T02:00:00+02:00").unwrap();
        assert_eq!(format_ts(ts), "2026-01-01T00:00:00Z");
        assert!(parse_ts("yesterday").is_none());
    }
}
