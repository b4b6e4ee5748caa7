use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Result, ThrottlerError};
use crate::kv::KvStore;

/// Process-local store that lives as long as the value.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: String,
    rows: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl KvStore for MemoryStore {
    fn table(&self) -> &str {
        &self.table
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let rows = self.rows.read()
            .map_err(|_| ThrottlerError::Internal("Failed to acquire read lock on rows".to_string()))?;
        Ok(rows.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut rows = self.rows.write()
            .map_err(|_| ThrottlerError::Internal("Failed to acquire write lock on rows".to_string()))?;
        rows.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut rows = self.rows.write()
            .map_err(|_| ThrottlerError::Internal("Failed to acquire write lock on rows".to_string()))?;
        Ok(rows.remove(key).is_some())
    }

    fn compare_and_set(&self, key: &str, expected: Option<&str>, value: &str) -> Result<bool> {
        let mut rows = self.rows.write()
            .map_err(|_| ThrottlerError::Internal("Failed to acquire write lock on rows".to_string()))?;

        if rows.get(key).map(String::as_str) != expected {
            return Ok(false);
        }

        rows.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_delete() {
        let store = MemoryStore::new("t");
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", "v1").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v1"));

        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_compare_and_set() {
        let store = MemoryStore::new("t");

        assert!(store.compare_and_set("k", None, "v1").unwrap());
        assert!(!store.compare_and_set("k", None, "v2").unwrap());
        assert!(!store.compare_and_set("k", Some("stale"), "v2").unwrap());
        assert!(store.compare_and_set("k", Some("v1"), "v2").unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
    }
}
