//! Snapshot-isolated reads of a live SQLite file.
//!
//! Readers must never wedge on the capture writer. Each attempt first opens
//! the file read-only and immutable; on a transient failure it copies the
//! database with the online backup API into a private temp file and reads
//! that copy instead. Whole attempts are retried with backoff while failures
//! stay transient.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::backup::StepResult;
use rusqlite::{Connection, OpenFlags};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{StoreError, is_transient_message};
use crate::retry::{RetryPolicy, with_retry_outcome};
use crate::store::SqliteStore;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("database not found: {0}")]
    Missing(String),

    #[error("sqlite: {0}")]
    Sqlite(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("snapshot I/O: {0}")]
    Io(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl ReadError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(message) => is_transient_message(message),
            Self::Store(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for ReadError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sqlite(err.to_string())
    }
}

/// Where a [`ReadHandle`] is reading from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// The live file, opened immutable
    Direct,
    /// A backup-API copy in a private temp directory
    Snapshot,
}

impl fmt::Display for ReadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub policy: RetryPolicy,
    /// Skip the direct open and read a snapshot straight away
    pub force_snapshot: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::snapshot_read(),
            force_snapshot: false,
        }
    }
}

/// A read-only store plus whatever keeps its snapshot alive.
#[derive(Debug)]
pub struct ReadHandle {
    // Declared before `snapshot_dir` so the connection closes first.
    store: SqliteStore,
    source: ReadSource,
    attempts: u32,
    path: PathBuf,
    snapshot_dir: Option<TempDir>,
}

impl ReadHandle {
    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    #[must_use]
    pub fn into_store(self) -> (SqliteStore, Option<TempDir>) {
        (self.store, self.snapshot_dir)
    }

    #[must_use]
    pub fn source(&self) -> ReadSource {
        self.source
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open `path` for reading with direct-then-snapshot fallback and retries.
pub fn open_resilient(path: &Path, options: &ReadOptions) -> Result<ReadHandle, ReadError> {
    if !path.exists() {
        return Err(ReadError::Missing(path.display().to_string()));
    }
    let outcome = with_retry_outcome(&options.policy, ReadError::is_transient, || {
        open_once(path, options.force_snapshot)
    });
    match outcome.result {
        Ok((store, source, snapshot_dir)) => {
            debug!(db = %path.display(), %source, attempts = outcome.attempts, "Opened database for reading");
            Ok(ReadHandle {
                store,
                source,
                attempts: outcome.attempts,
                path: path.to_path_buf(),
                snapshot_dir,
            })
        }
        Err(err) if err.is_transient() => Err(ReadError::Exhausted {
            attempts: outcome.attempts,
            last: err.to_string(),
        }),
        Err(err) => Err(err),
    }
}

type Opened = (SqliteStore, ReadSource, Option<TempDir>);

fn open_once(path: &Path, force_snapshot: bool) -> Result<Opened, ReadError> {
    if !force_snapshot {
        match open_direct(path) {
            Ok(store) => return Ok((store, ReadSource::Direct, None)),
            Err(err) if err.is_transient() => {
                info!(db = %path.display(), error = %err, "Direct read failed, falling back to snapshot");
            }
            Err(err) => return Err(err),
        }
    }
    let (store, dir) = open_snapshot(path)?;
    Ok((store, ReadSource::Snapshot, Some(dir)))
}

/// `file:` URI for a path, escaping the characters SQLite treats specially.
#[must_use]
pub fn immutable_uri(path: &Path) -> String {
    let mut encoded = String::new();
    for ch in path.display().to_string().chars() {
        match ch {
            '%' => encoded.push_str("%25"),
            '?' => encoded.push_str("%3F"),
            '#' => encoded.push_str("%23"),
            other => encoded.push(other),
        }
    }
    format!("file:{encoded}?mode=ro&immutable=1")
}

fn probe(store: &SqliteStore) -> Result<(), ReadError> {
    let sql = format!("SELECT COUNT(*) FROM {}", store.table());
    store
        .connection()
        .query_row(&sql, [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

fn open_direct(path: &Path) -> Result<SqliteStore, ReadError> {
    let conn = Connection::open_with_flags(
        immutable_uri(path),
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let store = SqliteStore::from_connection(conn, path.display().to_string())?;
    probe(&store)?;
    Ok(store)
}

fn open_snapshot(path: &Path) -> Result<(SqliteStore, TempDir), ReadError> {
    let dir = tempfile::Builder::new()
        .prefix("autocapture-snapshot-")
        .tempdir()
        .map_err(|e| ReadError::Io(e.to_string()))?;
    let snapshot_path = dir.path().join("snapshot.db");

    let src = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    src.busy_timeout(Duration::from_secs(2))?;
    let mut dest = Connection::open(&snapshot_path)?;
    {
        let backup = rusqlite::backup::Backup::new(&src, &mut dest)?;
        match backup.step(-1)? {
            StepResult::Done => {}
            StepResult::Busy => return Err(ReadError::Sqlite("snapshot copy: database busy".to_string())),
            StepResult::Locked => {
                return Err(ReadError::Sqlite("snapshot copy: database is locked".to_string()));
            }
            _ => return Err(ReadError::Sqlite("snapshot copy: incomplete, source busy".to_string())),
        }
    }
    drop(src);

    let store = SqliteStore::from_connection(dest, path.display().to_string())?;
    if let Err(err) = probe(&store) {
        warn!(db = %path.display(), error = %err, "Snapshot probe failed");
        return Err(err);
    }
    Ok((store, dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordStore;
    use serde_json::json;

    fn seeded_db(dir: &Path) -> PathBuf {
        let path = dir.join("metadata.db");
        let store = SqliteStore::open(&path).unwrap();
        store
            .put("r/f/1", &json!({"record_type": "evidence.capture.frame"}))
            .unwrap();
        path
    }

    #[test]
    fn direct_open_reads_committed_rows() {
        let dir = TempDir::new().unwrap();
        let path = seeded_db(dir.path());
        let handle = open_resilient(&path, &ReadOptions::default()).unwrap();
        assert_eq!(handle.source(), ReadSource::Direct);
        assert_eq!(handle.attempts(), 1);
        assert!(handle.store().get("r/f/1").unwrap().is_some());
    }

    #[test]
    fn snapshot_copy_is_readable_and_isolated() {
        let dir = TempDir::new().unwrap();
        let path = seeded_db(dir.path());
        let handle = open_resilient(
            &path,
            &ReadOptions {
                policy: RetryPolicy::immediate(1),
                force_snapshot: true,
            },
        )
        .unwrap();
        assert_eq!(handle.source(), ReadSource::Snapshot);

        let writer = SqliteStore::open(&path).unwrap();
        writer
            .put("r/f/2", &json!({"record_type": "evidence.capture.frame"}))
            .unwrap();
        assert!(handle.store().get("r/f/1").unwrap().is_some());
        assert!(handle.store().get("r/f/2").unwrap().is_none());
    }

    #[test]
    fn missing_file_is_not_retried() {
        let err = open_resilient(Path::new("/nonexistent/metadata.db"), &ReadOptions::default())
            .unwrap_err();
        assert!(matches!(err, ReadError::Missing(_)));
    }

    #[test]
    fn unknown_schema_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE events (id INTEGER);")
            .unwrap();
        let err = open_resilient(&path, &ReadOptions::default()).unwrap_err();
        assert!(matches!(err, ReadError::Store(StoreError::UnsupportedSchema { .. })));
    }

    #[test]
    fn uri_escapes_reserved_characters() {
        assert_eq!(
            immutable_uri(Path::new("/data/a?b#c%d.db")),
            "file:/data/a%3Fb%23c%25d.db?mode=ro&immutable=1"
        );
    }

    #[test]
    fn transience_follows_fingerprints() {
        assert!(ReadError::Sqlite("database is locked".to_string()).is_transient());
        assert!(!ReadError::Missing("x".to_string()).is_transient());
        assert!(!ReadError::Exhausted { attempts: 3, last: "busy".to_string() }.is_transient());
    }
}
