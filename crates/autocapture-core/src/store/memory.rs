use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::RecordStore;
use crate::error::StoreError;

/// Ordered in-process store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<BTreeMap<String, Value>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub fn remove(&self, id: &str) -> Option<Value> {
        self.records().remove(id)
    }
}

impl RecordStore for InMemoryStore {
    fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.records().get(id).cloned())
    }

    fn put_new(&self, id: &str, payload: &Value) -> Result<(), StoreError> {
        let mut records = self.records();
        if records.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        records.insert(id.to_string(), payload.clone());
        Ok(())
    }

    fn put(&self, id: &str, payload: &Value) -> Result<(), StoreError> {
        self.records().insert(id.to_string(), payload.clone());
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_new_rejects_existing() {
        let store = InMemoryStore::new();
        store.put_new("a", &json!(1)).unwrap();
        assert!(store.put_new("a", &json!(2)).unwrap_err().is_already_exists());
        store.put("a", &json!(3)).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(json!(3)));
        assert_eq!(store.len(), 1);
    }
}
