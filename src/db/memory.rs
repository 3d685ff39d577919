//! In-memory key-value store
//!
//! Used by tests and by hosts that run without durable storage. Can be
//! switched to "unavailable" to exercise the quota-exceeded / storage
//! disabled paths.

use super::{KeyValueStore, StorageError, StorageResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (reads keep working)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite a raw value, bypassing any service (corruption tests)
    pub fn put_raw(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("quota exceeded".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn save(&self, key: &str, value: &str) -> StorageResult<()> {
        self.check_available()?;
        self.put_raw(key, value);
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.check_available()?;
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
