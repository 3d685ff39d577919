//! Offline Store - durable map of local writes not yet synced
//!
//! Features:
//! - Per-record SHA-256 checksum, re-verified on every read
//! - Monotonic version per (resource_type, id), kept in separate metadata so
//!   it keeps counting after the record is removed
//! - In-memory map is authoritative for the running process; durable
//!   persistence is best effort and a failure never reaches the caller

use crate::clock::SharedClock;
use crate::db::{self, SharedStore, StorageResult};
use crate::sync::models::{record_key, StoredRecord};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type RecordMap = HashMap<String, StoredRecord>;
type VersionMap = HashMap<String, u64>;

/// Local versioned, checksummed record store
#[derive(Clone)]
pub struct OfflineStore {
    storage: SharedStore,
    clock: SharedClock,
    records: Arc<RwLock<RecordMap>>,
    versions: Arc<RwLock<VersionMap>>,
}

impl OfflineStore {
    /// Open the store, loading any persisted records. Unreadable keys start empty.
    pub fn new(storage: SharedStore, clock: SharedClock) -> Self {
        let records: RecordMap = db::read_json_or_default(storage.as_ref(), db::OFFLINE_DATA_KEY);
        let versions: VersionMap = db::read_json_or_default(storage.as_ref(), db::OFFLINE_VERSIONS_KEY);

        if !records.is_empty() {
            log::info!("Offline store loaded {} pending records", records.len());
        }

        Self {
            storage,
            clock,
            records: Arc::new(RwLock::new(records)),
            versions: Arc::new(RwLock::new(versions)),
        }
    }

    /// Record a local write stamped with the current time
    pub fn store(&self, resource_type: &str, id: &str, payload: Value) -> StoredRecord {
        let now = self.clock.now();
        self.store_with_timestamp(resource_type, id, payload, now)
    }

    /// Record a local write with an explicit local timestamp
    pub fn store_with_timestamp(
        &self,
        resource_type: &str,
        id: &str,
        payload: Value,
        local_timestamp: DateTime<Utc>,
    ) -> StoredRecord {
        let key = record_key(resource_type, id);

        let version = {
            let mut versions = self.versions.write().unwrap_or_else(|e| e.into_inner());
            let next = versions.get(&key).copied().unwrap_or(0) + 1;
            versions.insert(key.clone(), next);
            next
        };

        let record = StoredRecord::new(resource_type, id, payload, local_timestamp, version);
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, record.clone());

        log::debug!("Stored {}/{} locally (version {})", resource_type, id, version);
        self.persist_or_log();
        record
    }

    /// Payload for a record, or `None` if missing or corrupted
    pub fn get(&self, resource_type: &str, id: &str) -> Option<Value> {
        self.record(resource_type, id).map(|record| record.payload)
    }

    /// Full record after checksum verification. A corrupted record is
    /// deleted and reported as absent.
    pub fn record(&self, resource_type: &str, id: &str) -> Option<StoredRecord> {
        let key = record_key(resource_type, id);
        let record = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()?;

        if record.verify() {
            return Some(record);
        }

        log::warn!(
            "Checksum mismatch for {}/{} (version {}), discarding record",
            resource_type, id, record.version
        );
        self.discard_corrupted(std::slice::from_ref(&record));
        None
    }

    /// Delete a record (after sync or explicit clear)
    pub fn remove(&self, resource_type: &str, id: &str) {
        let key = record_key(resource_type, id);
        let removed = self
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
            .is_some();

        if removed {
            log::debug!("Removed {}/{} from offline store", resource_type, id);
            self.persist_or_log();
        }
    }

    /// Snapshot of every valid record, oldest local write first, plus the
    /// number of corrupted records discarded while collecting it
    pub fn entries(&self) -> (Vec<StoredRecord>, usize) {
        let snapshot: Vec<StoredRecord> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let (mut valid, corrupted): (Vec<_>, Vec<_>) =
            snapshot.into_iter().partition(StoredRecord::verify);

        for record in &corrupted {
            log::warn!(
                "Checksum mismatch for {}/{}, discarding record",
                record.resource_type, record.id
            );
        }
        self.discard_corrupted(&corrupted);

        valid.sort_by(|a, b| a.local_timestamp.cmp(&b.local_timestamp).then(a.id.cmp(&b.id)));
        (valid, corrupted.len())
    }

    /// Latest version issued for an id (survives removal)
    pub fn version(&self, resource_type: &str, id: &str) -> Option<u64> {
        self.versions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&record_key(resource_type, id))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending record (version metadata is kept)
    pub fn clear(&self) {
        self.records.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.persist_or_log();
        log::info!("Offline store cleared");
    }

    /// Remove records found corrupted, unless a newer write replaced them
    /// after they were read
    fn discard_corrupted(&self, corrupted: &[StoredRecord]) {
        if corrupted.is_empty() {
            return;
        }

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for record in corrupted {
            let key = record.storage_key();
            let unchanged = records
                .get(&key)
                .is_some_and(|current| current.version == record.version && current.checksum == record.checksum);
            if unchanged {
                records.remove(&key);
                removed += 1;
            }
        }
        drop(records);

        if removed > 0 {
            self.persist_or_log();
        }
    }

    fn persist(&self) -> StorageResult<()> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner()).clone();
        let versions = self.versions.read().unwrap_or_else(|e| e.into_inner()).clone();
        db::write_json(self.storage.as_ref(), db::OFFLINE_DATA_KEY, &records)?;
        db::write_json(self.storage.as_ref(), db::OFFLINE_VERSIONS_KEY, &versions)
    }

    fn persist_or_log(&self) {
        if let Err(e) = self.persist() {
            log::warn!("Offline store kept in memory only, persistence failed: {}", e);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{KeyValueStore, MemoryStore};
    use chrono::Duration;
    use serde_json::json;

    fn create_test_store() -> (OfflineStore, Arc<MemoryStore>, ManualClock) {
        let storage = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let store = OfflineStore::new(storage.clone(), Arc::new(clock.clone()));
        (store, storage, clock)
    }

    #[test]
    fn test_store_and_get() {
        let (store, _storage, _clock) = create_test_store();

        store.store("notes", "1", json!({"title": "draft"}));
        assert_eq!(store.get("notes", "1"), Some(json!({"title": "draft"})));
        assert!(store.get("notes", "2").is_none());
        assert!(store.get("tasks", "1").is_none());
    }

    #[test]
    fn test_versions_are_monotonic() {
        let (store, _storage, _clock) = create_test_store();

        assert_eq!(store.store("notes", "1", json!(1)).version, 1);
        assert_eq!(store.store("notes", "1", json!(2)).version, 2);
        assert_eq!(store.store("notes", "2", json!(1)).version, 1);

        // Removal keeps the counter
        store.remove("notes", "1");
        assert_eq!(store.version("notes", "1"), Some(2));
        assert_eq!(store.store("notes", "1", json!(3)).version, 3);
    }

    #[test]
    fn test_in_memory_corruption_is_discarded() {
        let (store, _storage, _clock) = create_test_store();
        store.store("notes", "1", json!({"body": "original"}));

        {
            let mut records = store.records.write().unwrap();
            let record = records.get_mut("notes/1").unwrap();
            record.payload = json!({"body": "bit flip"});
        }

        assert!(store.get("notes", "1").is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_persisted_corruption_is_discarded_on_reload() {
        let (store, storage, clock) = create_test_store();
        store.store("notes", "1", json!({"body": "original"}));
        store.store("notes", "2", json!({"body": "fine"}));

        // Tamper with the serialized record out-of-band
        let raw = storage.load(db::OFFLINE_DATA_KEY).unwrap().unwrap();
        let tampered = raw.replace("original", "tampered");
        storage.put_raw(db::OFFLINE_DATA_KEY, &tampered);

        let reopened = OfflineStore::new(storage.clone(), Arc::new(clock));
        assert!(reopened.get("notes", "1").is_none());
        assert_eq!(reopened.get("notes", "2"), Some(json!({"body": "fine"})));

        // Removal was persisted too
        let raw = storage.load(db::OFFLINE_DATA_KEY).unwrap().unwrap();
        assert!(!raw.contains("notes/1"));
    }

    #[test]
    fn test_entries_sorted_and_filtered() {
        let (store, _storage, clock) = create_test_store();
        store.store("notes", "b", json!(1));
        clock.advance(Duration::seconds(1));
        store.store("notes", "a", json!(2));
        clock.advance(Duration::seconds(1));
        store.store("notes", "c", json!(3));

        store.records.write().unwrap().get_mut("notes/c").unwrap().checksum = "bad".into();

        let (entries, discarded) = store.entries();
        assert_eq!(discarded, 1);
        let ids: Vec<&str> = entries.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_discard_keeps_newer_write() {
        let (store, _storage, _clock) = create_test_store();
        let mut stale = store.store("notes", "1", json!({"body": "v1"}));
        stale.checksum = "bad".into();

        // A fresh write lands between the read and the discard
        store.store("notes", "1", json!({"body": "v2"}));
        store.discard_corrupted(&[stale]);

        assert_eq!(store.get("notes", "1"), Some(json!({"body": "v2"})));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_storage_failure_keeps_memory_path() {
        let (store, storage, _clock) = create_test_store();
        storage.set_unavailable(true);

        store.store("notes", "1", json!("offline"));
        assert_eq!(store.get("notes", "1"), Some(json!("offline")));
        assert!(storage.load(db::OFFLINE_DATA_KEY).unwrap().is_none());
    }

    #[test]
    fn test_corrupted_key_defaults_to_empty() {
        let storage = Arc::new(MemoryStore::new());
        storage.put_raw(db::OFFLINE_DATA_KEY, "{{{ not json");

        let store = OfflineStore::new(storage, Arc::new(ManualClock::default()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear() {
        let (store, _storage, _clock) = create_test_store();
        store.store("notes", "1", json!(1));
        store.store("notes", "2", json!(2));

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.version("notes", "2"), Some(1));
    }
}
