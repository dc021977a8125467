use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::debug;

use super::{RecordStore, WindowEntry};
use crate::error::StoreError;
use crate::hashing::{canonical_json, run_id_of};
use crate::record::record_type_of;

/// Schema of a freshly created store.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    id TEXT PRIMARY KEY,
    record_type TEXT,
    ts_utc TEXT,
    payload TEXT NOT NULL,
    run_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_metadata_record_type ON metadata(record_type);
CREATE INDEX IF NOT EXISTS idx_metadata_ts_utc ON metadata(ts_utc);
CREATE INDEX IF NOT EXISTS idx_metadata_run_id ON metadata(run_id);
";

const KNOWN_TABLES: [&str; 2] = ["metadata", "records"];
const REQUIRED_COLUMNS: [&str; 4] = ["id", "record_type", "ts_utc", "payload"];

/// One row as stored, payload left as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub id: String,
    pub record_type: Option<String>,
    pub ts_utc: Option<String>,
    pub payload: String,
    pub run_id: Option<String>,
}

/// SQLite-backed record store over a `metadata` (or legacy `records`) table.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    table: &'static str,
    has_run_id: bool,
    label: String,
}

impl SqliteStore {
    /// Open or create a store file. Creates `metadata` when neither known
    /// table exists yet.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Database(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        if detect_table(&conn)?.is_none() {
            conn.execute_batch(SCHEMA_SQL)?;
        }
        Self::from_connection(conn, path.display().to_string())
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Self::from_connection(conn, ":memory:".to_string())
    }

    /// Wrap an existing connection. Never creates tables; a database with no
    /// known table is [`StoreError::UnsupportedSchema`].
    pub fn from_connection(conn: Connection, label: String) -> Result<Self, StoreError> {
        let Some(table) = detect_table(&conn)? else {
            return Err(StoreError::UnsupportedSchema {
                path: label,
                detail: "no `metadata` or `records` table".to_string(),
            });
        };
        let columns = table_columns(&conn, table)?;
        for required in REQUIRED_COLUMNS {
            if !columns.iter().any(|c| c == required) {
                return Err(StoreError::UnsupportedSchema {
                    path: label,
                    detail: format!("table `{table}` lacks column `{required}`"),
                });
            }
        }
        let has_run_id = columns.iter().any(|c| c == "run_id");
        debug!(db = %label, table, "Opened record store");
        Ok(Self {
            conn,
            table,
            has_run_id,
            label,
        })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn table(&self) -> &'static str {
        self.table
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().filter(|p| !p.is_empty()).map(PathBuf::from)
    }

    /// Every row in id order.
    pub fn rows(&self) -> Result<Vec<RawRow>, StoreError> {
        let run_id_expr = if self.has_run_id { "run_id" } else { "NULL" };
        let sql = format!(
            "SELECT id, record_type, ts_utc, payload, {run_id_expr} FROM {} ORDER BY id",
            self.table
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawRow {
                    id: row.get(0)?,
                    record_type: row.get(1)?,
                    ts_utc: row.get(2)?,
                    payload: row.get(3)?,
                    run_id: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert a row verbatim unless its id exists. Returns whether it was inserted.
    pub fn insert_raw(&self, row: &RawRow) -> Result<bool, StoreError> {
        let changed = if self.has_run_id {
            self.conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (id, record_type, ts_utc, payload, run_id) VALUES (?1, ?2, ?3, ?4, ?5)",
                    self.table
                ),
                params![row.id, row.record_type, row.ts_utc, row.payload, row.run_id],
            )?
        } else {
            self.conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (id, record_type, ts_utc, payload) VALUES (?1, ?2, ?3, ?4)",
                    self.table
                ),
                params![row.id, row.record_type, row.ts_utc, row.payload],
            )?
        };
        Ok(changed > 0)
    }

    fn row_for(id: &str, payload: &Value) -> RawRow {
        let run_id = payload
            .get("run_id")
            .and_then(Value::as_str)
            .map_or_else(|| run_id_of(id).to_string(), str::to_string);
        RawRow {
            id: id.to_string(),
            record_type: record_type_of(payload).map(str::to_string),
            ts_utc: payload.get("ts_utc").and_then(Value::as_str).map(str::to_string),
            payload: canonical_json(payload),
            run_id: Some(run_id),
        }
    }
}

fn detect_table(conn: &Connection) -> Result<Option<&'static str>, StoreError> {
    for table in KNOWN_TABLES {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_some() {
            return Ok(Some(table));
        }
    }
    Ok(None)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

impl RecordStore for SqliteStore {
    fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT payload FROM {} WHERE id = ?1", self.table),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|text| {
                serde_json::from_str(&text).map_err(|e| StoreError::CorruptPayload {
                    id: id.to_string(),
                    detail: e.to_string(),
                })
            })
            .transpose()
    }

    fn put_new(&self, id: &str, payload: &Value) -> Result<(), StoreError> {
        if self.insert_raw(&Self::row_for(id, payload))? {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists(id.to_string()))
        }
    }

    fn put(&self, id: &str, payload: &Value) -> Result<(), StoreError> {
        let row = Self::row_for(id, payload);
        if self.has_run_id {
            self.conn.execute(
                &format!(
                    "INSERT INTO {} (id, record_type, ts_utc, payload, run_id) VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET record_type = excluded.record_type,
                        ts_utc = excluded.ts_utc, payload = excluded.payload, run_id = excluded.run_id",
                    self.table
                ),
                params![row.id, row.record_type, row.ts_utc, row.payload, row.run_id],
            )?;
        } else {
            self.conn.execute(
                &format!(
                    "INSERT INTO {} (id, record_type, ts_utc, payload) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET record_type = excluded.record_type,
                        ts_utc = excluded.ts_utc, payload = excluded.payload",
                    self.table
                ),
                params![row.id, row.record_type, row.ts_utc, row.payload],
            )?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {} ORDER BY id", self.table))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn contains(&self, id: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", self.table),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn ids_of_type(&self, record_type: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id FROM {} WHERE record_type = ?1 ORDER BY id",
            self.table
        ))?;
        let ids = stmt
            .query_map(params![record_type], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn ids_in_window(
        &self,
        type_prefix: &str,
        end_ts: &str,
        limit: usize,
    ) -> Result<Vec<WindowEntry>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT ts_utc, id FROM {}
             WHERE substr(record_type, 1, length(?1)) = ?1
               AND julianday(ts_utc) IS NOT NULL
               AND julianday(ts_utc) <= julianday(?2)
             ORDER BY julianday(ts_utc), ts_utc, id LIMIT ?3",
            self.table
        ))?;
        let entries = stmt
            .query_map(params![type_prefix, end_ts, limit], |row| {
                Ok(WindowEntry {
                    ts_utc: row.get(0)?,
                    id: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn count_by_type(&self, record_type: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE record_type = ?1", self.table),
            params![record_type],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
