use std::collections::BTreeSet;

use serde_json::Value;

use super::{RecordStore, WindowEntry, sort_chronologically};
use crate::error::StoreError;

/// Read-through composition of a read-only source layer (ingest metadata)
/// and a writable derived layer (pipeline markers).
///
/// Reads check the derived layer first. Writes only ever reach the derived
/// layer, so background passes never take write locks on the live capture
/// database. `put_new` also refuses ids the source already holds, which keeps
/// markers written by older single-file deployments authoritative.
#[derive(Debug)]
pub struct OverlayStore<S, D> {
    source: S,
    derived: D,
}

impl<S: RecordStore, D: RecordStore> OverlayStore<S, D> {
    pub fn new(source: S, derived: D) -> Self {
        Self { source, derived }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn derived(&self) -> &D {
        &self.derived
    }

    pub fn into_parts(self) -> (S, D) {
        (self.source, self.derived)
    }
}

impl<S: RecordStore, D: RecordStore> RecordStore for OverlayStore<S, D> {
    fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        if let Some(payload) = self.derived.get(id)? {
            return Ok(Some(payload));
        }
        self.source.get(id)
    }

    fn put_new(&self, id: &str, payload: &Value) -> Result<(), StoreError> {
        if self.source.contains(id)? {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        self.derived.put_new(id, payload)
    }

    fn put(&self, id: &str, payload: &Value) -> Result<(), StoreError> {
        self.derived.put(id, payload)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: BTreeSet<String> = self.source.keys()?.into_iter().collect();
        keys.extend(self.derived.keys()?);
        Ok(keys.into_iter().collect())
    }

    fn contains(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.derived.contains(id)? || self.source.contains(id)?)
    }

    fn ids_of_type(&self, record_type: &str) -> Result<Vec<String>, StoreError> {
        let mut ids: BTreeSet<String> = self.source.ids_of_type(record_type)?.into_iter().collect();
        ids.extend(self.derived.ids_of_type(record_type)?);
        Ok(ids.into_iter().collect())
    }

    fn ids_in_window(
        &self,
        type_prefix: &str,
        end_ts: &str,
        limit: usize,
    ) -> Result<Vec<WindowEntry>, StoreError> {
        let mut merged = self.source.ids_in_window(type_prefix, end_ts, limit)?;
        merged.extend(self.derived.ids_in_window(type_prefix, end_ts, limit)?);
        sort_chronologically(&mut merged);
        let mut seen = BTreeSet::new();
        Ok(merged
            .into_iter()
            .filter(|entry| seen.insert(entry.id.clone()))
            .take(limit)
            .collect())
    }

    fn count_by_type(&self, record_type: &str) -> Result<usize, StoreError> {
        Ok(self.ids_of_type(record_type)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn overlay() -> OverlayStore<InMemoryStore, InMemoryStore> {
        let source = InMemoryStore::new();
        source
            .put("r/f/1", &json!({"record_type": "evidence.capture.frame"}))
            .unwrap();
        OverlayStore::new(source, InMemoryStore::new())
    }

    #[test]
    fn reads_fall_through_to_source() {
        let store = overlay();
        assert!(store.get("r/f/1").unwrap().is_some());
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn writes_only_reach_derived() {
        let store = overlay();
        store
            .put_new("r/m/1", &json!({"record_type": "derived.ingest.stage1.complete"}))
            .unwrap();
        assert!(store.derived().get("r/m/1").unwrap().is_some());
        assert!(store.source().get("r/m/1").unwrap().is_none());
        assert_eq!(store.keys().unwrap(), vec!["r/f/1", "r/m/1"]);
    }

    #[test]
    fn derived_shadows_source() {
        let store = overlay();
        store.put("r/f/1", &json!({"record_type": "shadow"})).unwrap();
        assert_eq!(store.get("r/f/1").unwrap().unwrap()["record_type"], "shadow");
    }

    #[test]
    fn put_new_respects_source_records() {
        let store = overlay();
        assert!(store
            .put_new("r/f/1", &json!({}))
            .unwrap_err()
            .is_already_exists());
        assert!(store.derived().is_empty());
    }
}
