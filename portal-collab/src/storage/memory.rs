//! In-process store. Expired keys are hidden on read and dropped on purge.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{KvStore, StoreError};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        match entries.get(key) {
            Some(e) if e.expires_at > Instant::now() => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_del() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(60)).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));

        store.del("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_overwrite() {
        let store = MemoryStore::new();
        store.set("k", "one", Duration::from_secs(60)).unwrap();
        store.set("k", "two", Duration::from_secs(60)).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("two"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expired_key_reads_absent() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::ZERO).unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set("old", "v", Duration::ZERO).unwrap();
        store.set("live", "v", Duration::from_secs(60)).unwrap();
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("live").unwrap().is_some());
    }
}
