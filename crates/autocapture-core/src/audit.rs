//! Read-only lineage audit.
//!
//! The auditor evaluates every frame with [`lineage::evaluate_frame`], the
//! same predicate the write path uses, counts issues, and groups consecutive
//! queryable frames into contiguous windows. Databases are opened through the
//! resilient reader, so a locked or mid-commit capture database degrades to a
//! snapshot read instead of failing.
//!
//! [`estimate_queryability`] is the cheap SQL-aggregate fallback used when a
//! full audit would exceed the caller's time budget.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::lineage::{self, FrameLineage};
use crate::record::{FRAME, FrameRecord, OBS_CONTEXT, OBS_FOCUS, OBS_OPERABLE, RETENTION_ELIGIBLE, Record, STAGE1_COMPLETE, parse_ts};
use crate::resilient::{ReadError, ReadOptions, ReadSource, open_resilient};
use crate::store::{OverlayStore, RecordStore, SqliteStore};

pub const DEFAULT_GAP_SECONDS: i64 = 120;
pub const DEFAULT_SAMPLES: usize = 10;

#[derive(Debug, Clone)]
pub struct AuditOptions {
    /// Largest gap between consecutive queryable frames inside one window
    pub gap_seconds: i64,
    /// Non-queryable frames included verbatim in the report
    pub samples: usize,
    /// Audit only the newest N frames
    pub frame_limit: Option<usize>,
    pub read: ReadOptions,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            gap_seconds: DEFAULT_GAP_SECONDS,
            samples: DEFAULT_SAMPLES,
            frame_limit: None,
            read: ReadOptions::default(),
        }
    }
}

/// Counts the queryability gate works from. Also parsed back from audit JSON,
/// so older field names are accepted as aliases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSummary {
    pub frames_total: usize,
    pub frames_queryable: usize,
    /// Frames meeting the Stage1 predicate with a valid marker
    #[serde(alias = "stage1_complete_ok", alias = "frames_stage1_ok")]
    pub stage1_ok: usize,
    /// Frames whose retention marker is validated and not quarantined
    #[serde(alias = "retention_eligible_ok", alias = "frames_retention_ok")]
    pub retention_ok: usize,
    pub uia_required: usize,
    /// Raw marker and document counts; `None` when the source did not report them
    pub stage1_markers: Option<usize>,
    pub retention_markers: Option<usize>,
    pub obs_docs: Option<usize>,
    /// Produced by [`estimate_queryability`] rather than a full audit
    pub estimated: bool,
}

impl AuditSummary {
    #[must_use]
    pub fn queryable_ratio(&self) -> f64 {
        let denominator = self.stage1_ok.max(self.frames_total);
        if denominator == 0 {
            return 0.0;
        }
        self.frames_queryable as f64 / denominator as f64
    }
}

/// Run of consecutive queryable frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryableWindow {
    pub start_ts_utc: String,
    pub end_ts_utc: String,
    pub frames: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub db: Option<String>,
    pub derived_db: Option<String>,
    pub read_source: Option<String>,
    pub read_attempts: u32,
    #[serde(flatten)]
    pub summary: AuditSummary,
    pub queryable_ratio: f64,
    pub frames_with_issues: usize,
    pub issue_counts: BTreeMap<String, usize>,
    pub windows: Vec<QueryableWindow>,
    pub longest_window_frames: usize,
    pub samples: Vec<FrameLineage>,
}

fn load_frames(store: &dyn RecordStore) -> Result<Vec<(String, FrameRecord)>, StoreError> {
    let mut frames = Vec::new();
    for id in store.ids_of_type(FRAME)? {
        let Some(payload) = store.get(&id)? else { continue };
        match Record::frame(&payload) {
            Ok(frame) => frames.push((id, frame)),
            Err(e) => debug!(record_id = %id, error = %e, "Skipping undecodable frame"),
        }
    }
    // Oldest first; unparseable timestamps sort first.
    frames.sort_by(|(a_id, a), (b_id, b)| a.ts().cmp(&b.ts()).then_with(|| a_id.cmp(b_id)));
    Ok(frames)
}

/// Group consecutive queryable frames. Any non-queryable frame, unparseable
/// timestamp or gap above `gap_seconds` closes the current window.
#[must_use]
pub fn queryable_windows(evaluated: &[FrameLineage], gap_seconds: i64) -> Vec<QueryableWindow> {
    let mut windows = Vec::new();
    let mut current: Option<(String, String, i64, usize)> = None;
    for lineage in evaluated {
        let ts = lineage
            .ts_utc
            .as_deref()
            .and_then(|raw| parse_ts(raw).map(|ts| (raw.to_string(), ts.timestamp())));
        match (lineage.queryable, ts) {
            (true, Some((raw, secs))) => {
                current = match current.take() {
                    Some((start, _, last, n)) if secs - last <= gap_seconds => Some((start, raw, secs, n + 1)),
                    Some((start, end, _, n)) => {
                        windows.push(QueryableWindow {
                            start_ts_utc: start,
                            end_ts_utc: end,
                            frames: n,
                        });
                        Some((raw.clone(), raw, secs, 1))
                    }
                    None => Some((raw.clone(), raw, secs, 1)),
                };
            }
            _ => {
                if let Some((start, end, _, n)) = current.take() {
                    windows.push(QueryableWindow {
                        start_ts_utc: start,
                        end_ts_utc: end,
                        frames: n,
                    });
                }
            }
        }
    }
    if let Some((start, end, _, n)) = current {
        windows.push(QueryableWindow {
            start_ts_utc: start,
            end_ts_utc: end,
            frames: n,
        });
    }
    windows
}

/// Audit any store. Never writes.
pub fn audit_store(store: &dyn RecordStore, options: &AuditOptions) -> Result<AuditReport, StoreError> {
    let mut frames = load_frames(store)?;
    if let Some(limit) = options.frame_limit {
        let skip = frames.len().saturating_sub(limit);
        frames.drain(..skip);
    }

    let mut summary = AuditSummary::default();
    let mut issue_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut evaluated = Vec::with_capacity(frames.len());
    for (id, frame) in &frames {
        let lineage = lineage::evaluate_frame(store, id, frame)?;
        summary.frames_total += 1;
        summary.frames_queryable += usize::from(lineage.queryable);
        summary.stage1_ok += usize::from(lineage.stage1_ok);
        summary.retention_ok += usize::from(lineage.retention_ok);
        summary.uia_required += usize::from(lineage.uia_required);
        for issue in &lineage.issues {
            *issue_counts.entry(issue.clone()).or_default() += 1;
        }
        evaluated.push(lineage);
    }
    summary.stage1_markers = Some(store.count_by_type(STAGE1_COMPLETE)?);
    summary.retention_markers = Some(store.count_by_type(RETENTION_ELIGIBLE)?);
    summary.obs_docs = Some(
        store.count_by_type(OBS_FOCUS)? + store.count_by_type(OBS_CONTEXT)? + store.count_by_type(OBS_OPERABLE)?,
    );

    let windows = queryable_windows(&evaluated, options.gap_seconds);
    let longest_window_frames = windows.iter().map(|w| w.frames).max().unwrap_or(0);
    let frames_with_issues = evaluated.iter().filter(|l| !l.issues.is_empty()).count();
    let samples = evaluated
        .iter()
        .filter(|l| !l.queryable)
        .take(options.samples)
        .cloned()
        .collect();

    Ok(AuditReport {
        db: None,
        derived_db: None,
        read_source: None,
        read_attempts: 0,
        queryable_ratio: summary.queryable_ratio(),
        summary,
        frames_with_issues,
        issue_counts,
        windows,
        longest_window_frames,
        samples,
    })
}

/// Read-only overlay of a metadata database and an optional derived one.
pub struct AuditSource {
    pub store: OverlayStore<SqliteStore, SqliteStore>,
    pub source: ReadSource,
    pub attempts: u32,
    // Keep snapshot copies alive for as long as the store is open.
    _snapshots: Vec<tempfile::TempDir>,
}

/// Open `db` (and `derived_db` when it exists) through the resilient reader.
pub fn open_audit_source(db: &Path, derived_db: Option<&Path>, read: &ReadOptions) -> Result<AuditSource, ReadError> {
    let handle = open_resilient(db, read)?;
    let source = handle.source();
    let attempts = handle.attempts();
    let (metadata, snapshot) = handle.into_store();
    let mut snapshots: Vec<_> = snapshot.into_iter().collect();

    let derived = match derived_db.filter(|p| p.exists()) {
        Some(path) => {
            let (store, snapshot) = open_resilient(path, read)?.into_store();
            snapshots.extend(snapshot);
            store
        }
        None => SqliteStore::open_in_memory()?,
    };
    Ok(AuditSource {
        store: OverlayStore::new(metadata, derived),
        source,
        attempts,
        _snapshots: snapshots,
    })
}

/// Full audit of a database pair.
pub fn run_audit(db: &Path, derived_db: Option<&Path>, options: &AuditOptions) -> crate::Result<AuditReport> {
    let opened = open_audit_source(db, derived_db, &options.read)?;
    let mut report = audit_store(&opened.store, options)?;
    report.db = Some(db.display().to_string());
    report.derived_db = derived_db.map(|p| p.display().to_string());
    report.read_source = Some(opened.source.to_string());
    report.read_attempts = opened.attempts;
    info!(
        db = %db.display(),
        frames = report.summary.frames_total,
        queryable = report.summary.frames_queryable,
        windows = report.windows.len(),
        "Lineage audit"
    );
    Ok(report)
}

fn count_where(store: &SqliteStore, record_type: &str, predicate: &str) -> Result<usize, StoreError> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE record_type = ?1 AND ({predicate})",
        store.table()
    );
    let count: i64 = store
        .connection()
        .query_row(&sql, rusqlite::params![record_type], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

/// Approximate summary from SQL aggregates. Frames are counted once; marker
/// counts stand in for per-frame verdicts.
pub fn estimate_queryability(metadata: &SqliteStore, derived: Option<&SqliteStore>) -> Result<AuditSummary, StoreError> {
    let stores: Vec<&SqliteStore> = std::iter::once(metadata).chain(derived).collect();
    let mut stage1 = 0;
    let mut validated = 0;
    let mut retention_markers = 0;
    for store in &stores {
        stage1 += count_where(store, STAGE1_COMPLETE, "json_extract(payload, '$.complete') = 1")?;
        validated += count_where(
            store,
            RETENTION_ELIGIBLE,
            "json_extract(payload, '$.stage1_contract_validated') = 1 \
             AND COALESCE(json_extract(payload, '$.quarantine_pending'), 0) = 0",
        )?;
        retention_markers += store.count_by_type(RETENTION_ELIGIBLE)?;
    }
    let frames = metadata.count_by_type(FRAME)?;
    Ok(AuditSummary {
        frames_total: frames,
        frames_queryable: stage1.min(validated).min(frames),
        stage1_ok: stage1.min(frames),
        retention_ok: validated.min(frames),
        uia_required: 0,
        stage1_markers: Some(stage1),
        retention_markers: Some(retention_markers),
        obs_docs: None,
        estimated: true,
    })
}

/// Estimate straight from files, opened through the resilient reader.
pub fn estimate_from_paths(db: &Path, derived_db: Option<&Path>, read: &ReadOptions) -> crate::Result<AuditSummary> {
    let metadata = open_resilient(db, read)?;
    let derived = match derived_db.filter(|p| p.exists()) {
        Some(path) => Some(open_resilient(path, read)?),
        None => None,
    };
    Ok(estimate_queryability(metadata.store(), derived.as_ref().map(|h| h.store()))?)
}

/// `<db parent>/derived/stage1_derived.db`, when present.
#[must_use]
pub fn default_derived_for(db: &Path) -> Option<PathBuf> {
    let parent = db.parent()?;
    let candidate = crate::config::default_derived_db_path(parent);
    candidate.exists().then_some(candidate)
}
