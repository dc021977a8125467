//! Stage2 projection: searchable text documents and the screen-state record.
//!
//! The engine reads whatever observation context a frame has (possibly none)
//! and derives:
//! - one `derived.sst.text.extra` document per distinct non-blank text source
//!   (window title, then one document per observation section),
//! - exactly one `derived.sst.state` record per frame,
//! - a `derived.ingest.stage2.complete` marker once every write succeeded.
//!
//! Document ids are seeded from `(frame_id, doc_kind, ordinal, text hash)`,
//! so a rerun over unchanged inputs reproduces the same ids and inserts
//! nothing.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::hashing::{canonical_json, derived_id, hashed_id, run_id_of, sha256_text};
use crate::record::{FrameRecord, ObsNode, ObsSection, ObservationDocument, SST_STATE, SST_TEXT_EXTRA, STAGE2_COMPLETE};
use crate::store::RecordStore;
use crate::uia;

/// Tokens kept per screen-state record.
pub const MAX_STATE_TOKENS: usize = 512;

/// Why a projection pass ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage2Reason {
    /// Frame has neither a window title nor observation documents
    EmptyPayload,
    /// Sources exist but none produced a candidate document
    NoDocs,
    /// Every candidate was blank or a duplicate
    FilteredDocsEmpty,
    InsertFailed,
    Ok,
}

impl Stage2Reason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmptyPayload => "empty_payload",
            Self::NoDocs => "no_docs",
            Self::FilteredDocsEmpty => "filtered_docs_empty",
            Self::InsertFailed => "insert_failed",
            Self::Ok => "ok",
        }
    }
}

impl fmt::Display for Stage2Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage2Result {
    pub required: bool,
    pub ok: bool,
    pub generated_docs: usize,
    pub inserted_docs: usize,
    pub generated_states: usize,
    pub inserted_states: usize,
    pub errors: Vec<String>,
    pub reason: Stage2Reason,
}

/// A text document before it is given an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocCandidate {
    pub doc_kind: String,
    pub text: String,
}

fn node_line(node: &ObsNode) -> Option<String> {
    let label = [node.name.as_deref(), node.value.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" = ");
    if label.is_empty() {
        return None;
    }
    Some(match node.role.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(role) => format!("{role}: {label}"),
        None => label,
    })
}

/// Raw candidates in source order. Blank texts are kept here and dropped by
/// [`filter_candidates`].
#[must_use]
pub fn candidate_docs(frame: &FrameRecord, observations: &[(ObsSection, ObservationDocument)]) -> Vec<DocCandidate> {
    let mut out = Vec::new();
    if let Some(title) = &frame.window_title {
        out.push(DocCandidate {
            doc_kind: "window_title".to_string(),
            text: title.clone(),
        });
    }
    for (section, doc) in observations {
        if doc.nodes.is_empty() {
            continue;
        }
        let text = doc.nodes.iter().filter_map(node_line).collect::<Vec<_>>().join("\n");
        out.push(DocCandidate {
            doc_kind: format!("uia_{}", section.name()),
            text,
        });
    }
    out
}

/// Drop blank and duplicate texts, keeping first occurrences.
#[must_use]
pub fn filter_candidates(candidates: Vec<DocCandidate>) -> Vec<DocCandidate> {
    let mut seen = BTreeSet::new();
    candidates
        .into_iter()
        .filter_map(|c| {
            let text = c.text.trim().to_string();
            if text.is_empty() || !seen.insert(text.clone()) {
                return None;
            }
            Some(DocCandidate { doc_kind: c.doc_kind, text })
        })
        .collect()
}

#[must_use]
pub fn doc_id(frame_id: &str, doc_kind: &str, ordinal: usize, text: &str) -> String {
    let text_hash = sha256_text(text);
    let seed = format!("{frame_id}|{doc_kind}|{ordinal}|{}", &text_hash[..16]);
    hashed_id(run_id_of(frame_id), SST_TEXT_EXTRA, &seed)
}

#[must_use]
pub fn state_id(frame_id: &str) -> String {
    derived_id(run_id_of(frame_id), SST_STATE, frame_id)
}

#[must_use]
pub fn marker_id(frame_id: &str) -> String {
    derived_id(run_id_of(frame_id), STAGE2_COMPLETE, frame_id)
}

/// Lowercased alphanumeric words of two or more characters, sorted, unique.
#[must_use]
pub fn tokenize<'a>(texts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut tokens = BTreeSet::new();
    for text in texts {
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if word.chars().count() >= 2 {
                tokens.insert(word.to_lowercase());
            }
        }
    }
    tokens.into_iter().take(MAX_STATE_TOKENS).collect()
}

/// Element graph over the focus chain: every observed node, with edges
/// linking consecutive focus-path entries.
fn element_graph(observations: &[(ObsSection, ObservationDocument)]) -> Value {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    for (section, doc) in observations {
        let start = nodes.len();
        for node in &doc.nodes {
            nodes.push(json!({
                "section": section.name(),
                "eid": node.eid,
                "role": node.role,
                "name": node.name,
                "bbox": node.bbox,
            }));
        }
        if *section == ObsSection::Focus {
            for i in start..nodes.len().saturating_sub(1) {
                edges.push(json!([i, i + 1]));
            }
        }
    }
    json!({"nodes": nodes, "edges": edges})
}

fn visible_apps(frame: &FrameRecord, observations: &[(ObsSection, ObservationDocument)]) -> Vec<String> {
    let titles: BTreeSet<String> = observations
        .iter()
        .filter_map(|(_, doc)| doc.window_title.as_deref())
        .chain(frame.window_title.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    titles.into_iter().collect()
}

/// Screen-state payload for a frame.
#[must_use]
pub fn build_state(
    frame_id: &str,
    frame: &FrameRecord,
    observations: &[(ObsSection, ObservationDocument)],
    docs: &[DocCandidate],
) -> Value {
    let tokens = tokenize(docs.iter().map(|d| d.text.as_str()));
    let graph = element_graph(observations);
    let apps = visible_apps(frame, observations);
    let content_hash = sha256_text(&canonical_json(&json!({
        "tokens": tokens,
        "element_graph": graph,
        "visible_apps": apps,
    })));
    json!({
        "record_type": SST_STATE,
        "run_id": run_id_of(frame_id),
        "ts_utc": frame.ts_utc,
        "frame_id": frame_id,
        "source_record_id": frame_id,
        "tokens": tokens,
        "element_graph": graph,
        "visible_apps": apps,
        "content_hash": content_hash,
    })
}

fn doc_payload(frame_id: &str, frame: &FrameRecord, ordinal: usize, doc: &DocCandidate) -> Value {
    json!({
        "record_type": SST_TEXT_EXTRA,
        "run_id": run_id_of(frame_id),
        "ts_utc": frame.ts_utc,
        "source_record_id": frame_id,
        "doc_kind": doc.doc_kind,
        "ordinal": ordinal,
        "text": doc.text,
        "content_hash": sha256_text(&doc.text),
    })
}

/// Counts inserts. In dry-run mode, counts ids that would be inserted.
fn write(
    store: &dyn RecordStore,
    id: &str,
    payload: &Value,
    dry_run: bool,
    errors: &mut Vec<String>,
) -> Result<bool, StoreError> {
    if dry_run {
        return Ok(!store.contains(id)?);
    }
    match store.insert_if_absent(id, payload) {
        Ok(inserted) => Ok(inserted),
        Err(e) => {
            warn!(record_id = %id, error = %e, "Stage2 write failed");
            errors.push(format!("{id}: {e}"));
            Ok(false)
        }
    }
}

/// Project one frame given its observation documents.
pub fn project_with(
    store: &dyn RecordStore,
    frame_id: &str,
    frame: &FrameRecord,
    observations: &[(ObsSection, ObservationDocument)],
    dry_run: bool,
) -> Result<Stage2Result, StoreError> {
    let mut errors = Vec::new();
    let has_sources = frame.window_title.is_some() || !observations.is_empty();
    let candidates = candidate_docs(frame, observations);
    let candidate_count = candidates.len();
    let docs = filter_candidates(candidates);

    let mut inserted_docs = 0;
    for (ordinal, doc) in docs.iter().enumerate() {
        let id = doc_id(frame_id, &doc.doc_kind, ordinal, &doc.text);
        if write(store, &id, &doc_payload(frame_id, frame, ordinal, doc), dry_run, &mut errors)? {
            inserted_docs += 1;
        }
    }

    let state = build_state(frame_id, frame, observations, &docs);
    let inserted_states = usize::from(write(store, &state_id(frame_id), &state, dry_run, &mut errors)?);

    let (required, reason) = if !errors.is_empty() {
        (true, Stage2Reason::InsertFailed)
    } else if !has_sources {
        (false, Stage2Reason::EmptyPayload)
    } else if candidate_count == 0 {
        (true, Stage2Reason::NoDocs)
    } else if docs.is_empty() {
        (true, Stage2Reason::FilteredDocsEmpty)
    } else {
        (true, Stage2Reason::Ok)
    };

    let result = Stage2Result {
        required,
        ok: errors.is_empty(),
        generated_docs: docs.len(),
        inserted_docs,
        generated_states: 1,
        inserted_states,
        errors,
        reason,
    };

    if result.ok && !dry_run {
        let marker = json!({
            "record_type": STAGE2_COMPLETE,
            "run_id": run_id_of(frame_id),
            "ts_utc": frame.ts_utc,
            "source_record_id": frame_id,
            "complete": true,
            "reason": reason.as_str(),
            "generated_docs": result.generated_docs,
            "inserted_docs": result.inserted_docs,
            "generated_states": result.generated_states,
            "inserted_states": result.inserted_states,
        });
        if let Err(e) = store.insert_if_absent(&marker_id(frame_id), &marker) {
            warn!(frame_id, error = %e, "Stage2 marker write failed");
        }
    }
    debug!(
        frame_id,
        reason = %result.reason,
        generated_docs = result.generated_docs,
        inserted_docs = result.inserted_docs,
        "Stage2 projection"
    );
    Ok(result)
}

/// Project one frame, loading its observation documents from the store.
pub fn project_frame(
    store: &dyn RecordStore,
    frame_id: &str,
    frame: &FrameRecord,
    dry_run: bool,
) -> Result<Stage2Result, StoreError> {
    let observations = uia::load_observations(store, frame_id, frame)?;
    project_with(store, frame_id, frame, &observations, dry_run)
}
