//! Keyed record storage.
//!
//! [`RecordStore`] is the single interface the engine writes through. It has
//! four required operations (`get`, `put_new`, `put`, `keys`) and a few
//! query helpers with scan-based defaults that indexed backends override.
//! Callers never probe for capabilities: every store answers every query.
//!
//! Backends:
//! - [`SqliteStore`]: one table (`metadata`, or legacy `records`)
//! - [`InMemoryStore`]: ordered map, used by tests and dry runs
//! - [`OverlayStore`]: read-through composition of a source and a derived store

mod memory;
mod overlay;
mod sqlite;

use std::path::Path;

use serde_json::Value;

pub use memory::InMemoryStore;
pub use overlay::OverlayStore;
pub use sqlite::{RawRow, SCHEMA_SQL, SqliteStore};

use crate::error::StoreError;
use crate::record::{parse_ts, record_type_of};

/// An id with its stored timestamp, as returned by window queries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WindowEntry {
    pub ts_utc: String,
    pub id: String,
}

/// Order entries by instant, then id. Raw text order is wrong once offsets
/// or fractional seconds are mixed in.
pub fn sort_chronologically(entries: &mut [WindowEntry]) {
    entries.sort_by(|a, b| {
        (parse_ts(&a.ts_utc), &a.ts_utc, &a.id).cmp(&(parse_ts(&b.ts_utc), &b.ts_utc, &b.id))
    });
}

pub trait RecordStore {
    fn get(&self, id: &str) -> Result<Option<Value>, StoreError>;

    /// Insert only if absent. An existing id yields [`StoreError::AlreadyExists`].
    fn put_new(&self, id: &str, payload: &Value) -> Result<(), StoreError>;

    /// Insert or replace.
    fn put(&self, id: &str, payload: &Value) -> Result<(), StoreError>;

    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// `put_new` with the "already exists" outcome folded into `Ok(false)`.
    fn insert_if_absent(&self, id: &str, payload: &Value) -> Result<bool, StoreError> {
        match self.put_new(id, payload) {
            Ok(()) => Ok(true),
            Err(StoreError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn contains(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.get(id)?.is_some())
    }

    /// Ids whose payload has exactly this `record_type`, sorted.
    fn ids_of_type(&self, record_type: &str) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for id in self.keys()? {
            if let Some(payload) = self.get(&id)? {
                if record_type_of(&payload) == Some(record_type) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Up to `limit` records whose type starts with `type_prefix` and whose
    /// `ts_utc` is at or before `end_ts`, oldest first, ties broken by id.
    fn ids_in_window(
        &self,
        type_prefix: &str,
        end_ts: &str,
        limit: usize,
    ) -> Result<Vec<WindowEntry>, StoreError> {
        let Some(end) = parse_ts(end_ts) else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for id in self.keys()? {
            let Some(payload) = self.get(&id)? else {
                continue;
            };
            if !record_type_of(&payload).is_some_and(|rt| rt.starts_with(type_prefix)) {
                continue;
            }
            let Some(raw_ts) = payload.get("ts_utc").and_then(Value::as_str) else {
                continue;
            };
            if parse_ts(raw_ts).is_some_and(|ts| ts <= end) {
                entries.push(WindowEntry {
                    ts_utc: raw_ts.to_string(),
                    id,
                });
            }
        }
        sort_chronologically(&mut entries);
        entries.truncate(limit);
        Ok(entries)
    }

    fn count_by_type(&self, record_type: &str) -> Result<usize, StoreError> {
        Ok(self.ids_of_type(record_type)?.len())
    }
}

impl<T: RecordStore + ?Sized> RecordStore for &T {
    fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        (**self).get(id)
    }

    fn put_new(&self, id: &str, payload: &Value) -> Result<(), StoreError> {
        (**self).put_new(id, payload)
    }

    fn put(&self, id: &str, payload: &Value) -> Result<(), StoreError> {
        (**self).put(id, payload)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        (**self).keys()
    }

    fn ids_of_type(&self, record_type: &str) -> Result<Vec<String>, StoreError> {
        (**self).ids_of_type(record_type)
    }

    fn ids_in_window(
        &self,
        type_prefix: &str,
        end_ts: &str,
        limit: usize,
    ) -> Result<Vec<WindowEntry>, StoreError> {
        (**self).ids_in_window(type_prefix, end_ts, limit)
    }

    fn count_by_type(&self, record_type: &str) -> Result<usize, StoreError> {
        (**self).count_by_type(record_type)
    }
}

/// Overlay of the metadata database with the derived marker database.
pub type SqliteOverlay = OverlayStore<SqliteStore, SqliteStore>;

/// Open the standard two-file layout. Without a derived path, derived writes
/// land in the metadata database through a second connection.
pub fn open_overlay(metadata_db: &Path, derived_db: Option<&Path>) -> Result<SqliteOverlay, StoreError> {
    let source = SqliteStore::open(metadata_db)?;
    let derived = SqliteStore::open(derived_db.unwrap_or(metadata_db))?;
    Ok(OverlayStore::new(source, derived))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_window_query_orders_by_time_then_id() {
        let store = InMemoryStore::new();
        store
            .put("r/e/b", &json!({"record_type": "evidence.capture.frame", "ts_utc": "2026-01-01T00:00:00Z"}))
            .unwrap();
        store
            .put("r/e/a", &json!({"record_type": "evidence.capture.frame", "ts_utc": "2026-01-01T00:00:00Z"}))
            .unwrap();
        store
            .put("r/e/c", &json!({"record_type": "evidence.uia.snapshot", "ts_utc": "2025-12-31T00:00:00Z"}))
            .unwrap();
        store
            .put("r/e/late", &json!({"record_type": "evidence.capture.frame", "ts_utc": "2026-02-01T00:00:00Z"}))
            .unwrap();
        store
            .put("r/d/x", &json!({"record_type": "derived.sst.state", "ts_utc": "2025-01-01T00:00:00Z"}))
            .unwrap();

        let ids: Vec<String> = store
            .ids_in_window("evidence.", "2026-01-15T00:00:00Z", 10)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["r/e/c", "r/e/a", "r/e/b"]);

        let capped = store.ids_in_window("evidence.", "2026-01-15T00:00:00Z", 1).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn insert_if_absent_folds_already_exists() {
        let store = InMemoryStore::new();
        assert!(store.insert_if_absent("k", &json!({"v": 1})).unwrap());
        assert!(!store.insert_if_absent("k", &json!({"v": 2})).unwrap());
        assert_eq!(store.get("k").unwrap(), Some(json!({"v": 1})));
    }
}
