//! Append-only NDJSON journal with a tamper-evident hash chain.
//!
//! Each line carries `prev_hash` (the previous line's `entry_hash`, or
//! [`GENESIS_HASH`] for the first line) and `entry_hash`, the SHA-256 of the
//! line's canonical JSON without `entry_hash`. Appends hold an exclusive
//! advisory lock on the file so concurrent writers cannot fork the chain.
//!
//! Journal writes are best-effort: callers log a failure and carry on.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::hashing::{canonical_json, sha256_text};

// =============================================================================
// Constants
// =============================================================================

pub const JOURNAL_FILE_NAME: &str = "journal.ndjson";

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[must_use]
pub fn journal_path(data_dir: &Path) -> PathBuf {
    data_dir.join(JOURNAL_FILE_NAME)
}

// =============================================================================
// Entries
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub ordinal: u64,
    pub ts_utc: String,
    pub event: String,
    pub payload: Value,
    pub prev_hash: String,
    #[serde(default)]
    pub entry_hash: String,
}

impl JournalEntry {
    /// Hash over every field except `entry_hash`.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("entry_hash");
        }
        sha256_text(&canonical_json(&value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub total_entries: u64,
    pub chain_intact: bool,
    /// Ordinal of the first entry whose link or own hash does not verify
    pub first_break_at: Option<u64>,
    pub unparseable_lines: u64,
}

fn read_entries(path: &Path) -> io::Result<(Vec<JournalEntry>, u64)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut entries = Vec::new();
    let mut unparseable = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(_) => unparseable += 1,
        }
    }
    Ok((entries, unparseable))
}

/// Append one event, chaining it to the current tail.
pub fn append(path: &Path, event: &str, payload: Value, ts_utc: &str) -> io::Result<JournalEntry> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    let result = (|| {
        let (entries, _) = read_entries(path)?;
        let (ordinal, prev_hash) = entries.last().map_or_else(
            || (0, GENESIS_HASH.to_string()),
            |last| (last.ordinal + 1, last.entry_hash.clone()),
        );
        let mut entry = JournalEntry {
            ordinal,
            ts_utc: ts_utc.to_string(),
            event: event.to_string(),
            payload,
            prev_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash();
        let line = serde_json::to_string(&entry).map_err(io::Error::other)?;
        writeln!(file, "{line}")?;
        file.sync_data()?;
        Ok(entry)
    })();
    if let Err(e) = FileExt::unlock(&file) {
        warn!(journal = %path.display(), error = %e, "Failed to unlock journal");
    }
    result
}

/// Append and swallow failures into a warning. Returns the entry hash on success.
pub fn append_best_effort(path: &Path, event: &str, payload: Value, ts_utc: &str) -> Option<String> {
    match append(path, event, payload, ts_utc) {
        Ok(entry) => Some(entry.entry_hash),
        Err(e) => {
            warn!(journal = %path.display(), event, error = %e, "Journal append failed");
            None
        }
    }
}

/// Replay the chain from genesis.
pub fn verify_chain(path: &Path) -> io::Result<ChainVerification> {
    let (entries, unparseable) = read_entries(path)?;
    let mut prev_hash = GENESIS_HASH.to_string();
    let mut first_break_at = None;
    for entry in &entries {
        let linked = entry.prev_hash == prev_hash;
        let sealed = entry.entry_hash == entry.compute_hash();
        if (!linked || !sealed) && first_break_at.is_none() {
            first_break_at = Some(entry.ordinal);
        }
        prev_hash.clone_from(&entry.entry_hash);
    }
    Ok(ChainVerification {
        total_entries: entries.len() as u64,
        chain_intact: first_break_at.is_none() && unparseable == 0,
        first_break_at,
        unparseable_lines: unparseable,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn chain_links_entries() {
        let dir = TempDir::new().unwrap();
        let path = journal_path(dir.path());
        let first = append(&path, "retention.batch", json!({"n": 1}), "2026-01-01T00:00:00Z").unwrap();
        let second = append(&path, "handoff.completed", json!({"n": 2}), "2026-01-01T00:01:00Z").unwrap();
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.entry_hash);
        assert_eq!(second.ordinal, 1);

        let report = verify_chain(&path).unwrap();
        assert!(report.chain_intact);
        assert_eq!(report.total_entries, 2);
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let dir = TempDir::new().unwrap();
        let path = journal_path(dir.path());
        append(&path, "a", json!({"n": 1}), "2026-01-01T00:00:00Z").unwrap();
        append(&path, "b", json!({"n": 2}), "2026-01-01T00:00:00Z").unwrap();

        let text = fs::read_to_string(&path).unwrap().replace("\"n\":1", "\"n\":9");
        fs::write(&path, text).unwrap();

        let report = verify_chain(&path).unwrap();
        assert!(!report.chain_intact);
        assert_eq!(report.first_break_at, Some(0));
    }

    #[test]
    fn missing_journal_verifies_empty() {
        let dir = TempDir::new().unwrap();
        let report = verify_chain(&dir.path().join("none.ndjson")).unwrap();
        assert!(report.chain_intact);
        assert_eq!(report.total_entries, 0);
    }

    #[test]
    fn best_effort_append_reports_failure_as_none() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be
        let path = dir.path().join("journal.ndjson");
        fs::create_dir_all(&path).unwrap();
        assert!(append_best_effort(&path, "x", json!({}), "2026-01-01T00:00:00Z").is_none());
    }
}
