//! Conflict Queue & Resolver
//!
//! A conflict is recorded when the server copy of an entity was modified
//! after the local write. It stays queued until a strategy resolves it or it
//! is cleared.
//!
//! Strategies:
//! - `client-wins`: push the client payload
//! - `server-wins`: keep the server payload locally, no network call
//! - `merge`: shallow merge, server fields win except client-authoritative ones
//! - `manual`: push a caller-supplied payload

use super::api::{ApiError, SharedApi};
use super::connectivity::StateHub;
use super::models::{record_key, ConflictRecord, ConflictStrategy, StoredRecord};
use crate::clock::SharedClock;
use crate::db::{self, SharedStore, StorageError};
use crate::store::OfflineStore;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

// ============================================================================
// Conflict Queue
// ============================================================================

/// Persisted list of unresolved conflicts, one per (resource_type, id)
#[derive(Clone)]
pub struct ConflictQueue {
    storage: SharedStore,
    hub: StateHub,
    records: Arc<Mutex<Vec<ConflictRecord>>>,
}

impl ConflictQueue {
    pub fn new(storage: SharedStore, hub: StateHub) -> Self {
        let records: Vec<ConflictRecord> =
            db::read_json_or_default(storage.as_ref(), db::CONFLICT_QUEUE_KEY);
        let open = records.len();
        hub.update(|state| state.open_conflicts = open);

        Self {
            storage,
            hub,
            records: Arc::new(Mutex::new(records)),
        }
    }

    /// Queue a conflict, replacing an earlier one for the same entity
    pub fn push(&self, conflict: ConflictRecord) {
        {
            let mut records = self.lock();
            records.retain(|c| !(c.resource_type == conflict.resource_type && c.id == conflict.id));
            records.push(conflict);
        }
        self.changed();
    }

    pub fn get(&self, resource_type: &str, id: &str) -> Option<ConflictRecord> {
        self.lock()
            .iter()
            .find(|c| c.resource_type == resource_type && c.id == id)
            .cloned()
    }

    pub fn remove(&self, resource_type: &str, id: &str) -> Option<ConflictRecord> {
        let removed = {
            let mut records = self.lock();
            let index = records
                .iter()
                .position(|c| c.resource_type == resource_type && c.id == id)?;
            records.remove(index)
        };
        self.changed();
        Some(removed)
    }

    /// All open conflicts, oldest detection first
    pub fn list(&self) -> Vec<ConflictRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        let count = {
            let mut records = self.lock();
            let count = records.len();
            records.clear();
            count
        };
        self.changed();
        count
    }

    fn changed(&self) {
        if let Err(e) = self.persist() {
            log::warn!("Conflict queue kept in memory only: {}", e);
        }
        let open = self.len();
        self.hub.update(|state| state.open_conflicts = open);
    }

    fn persist(&self) -> Result<(), StorageError> {
        let records = self.list();
        db::write_json(self.storage.as_ref(), db::CONFLICT_QUEUE_KEY, &records)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ConflictRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Conflict Resolver
// ============================================================================

/// Applies resolution strategies to queued conflicts
#[derive(Clone)]
pub struct ConflictResolver {
    conflicts: ConflictQueue,
    store: OfflineStore,
    api: SharedApi,
    clock: SharedClock,
    client_authoritative_fields: Arc<Vec<String>>,
}

impl ConflictResolver {
    pub fn new(
        conflicts: ConflictQueue,
        store: OfflineStore,
        api: SharedApi,
        clock: SharedClock,
        client_authoritative_fields: Vec<String>,
    ) -> Self {
        Self {
            conflicts,
            store,
            api,
            clock,
            client_authoritative_fields: Arc::new(client_authoritative_fields),
        }
    }

    /// Resolve a conflict; `false` leaves it queued for another attempt
    pub async fn resolve(
        &self,
        id: &str,
        resource_type: &str,
        strategy: ConflictStrategy,
        manual_payload: Option<Value>,
    ) -> bool {
        match self.try_resolve(id, resource_type, strategy, manual_payload).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!(
                    "Could not resolve conflict for {} ({}): {}",
                    record_key(resource_type, id), strategy.as_str(), e
                );
                false
            }
        }
    }

    /// Resolve a conflict and return the record now held in the offline store.
    ///
    /// The record is stamped no earlier than the server's last-modified
    /// marker so the next sync pass does not report the same conflict again.
    pub async fn try_resolve(
        &self,
        id: &str,
        resource_type: &str,
        strategy: ConflictStrategy,
        manual_payload: Option<Value>,
    ) -> Result<StoredRecord, ResolveError> {
        let conflict = self
            .conflicts
            .get(resource_type, id)
            .ok_or_else(|| ResolveError::NotFound(record_key(resource_type, id)))?;
        let now = self.clock.now();

        let (payload, stamp) = match strategy {
            ConflictStrategy::ServerWins => {
                let stamp = conflict.server_modified_at.unwrap_or(now);
                (conflict.server_payload.clone(), stamp)
            }
            ConflictStrategy::ClientWins | ConflictStrategy::Merge | ConflictStrategy::Manual => {
                let payload = match strategy {
                    ConflictStrategy::Manual => manual_payload.ok_or(ResolveError::ManualPayloadRequired)?,
                    ConflictStrategy::Merge => merge_payloads(
                        &conflict.client_payload,
                        &conflict.server_payload,
                        &self.client_authoritative_fields,
                    ),
                    _ => conflict.client_payload.clone(),
                };

                let pushed = self.api.update(resource_type, id, &payload).await?;
                let stamp = [Some(now), pushed.last_modified, conflict.server_modified_at]
                    .into_iter()
                    .flatten()
                    .max()
                    .unwrap_or(now);
                (pushed_payload_or(payload, pushed.payload), stamp)
            }
        };

        let record = self.store.store_with_timestamp(resource_type, id, payload, stamp);
        self.conflicts.remove(resource_type, id);

        log::info!(
            "Resolved conflict for {}/{} with {}",
            resource_type, id, strategy.as_str()
        );
        Ok(record)
    }

    /// Open conflicts
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.list()
    }

    /// Drop a conflict without resolving it (operator action)
    pub fn clear_conflict(&self, id: &str, resource_type: &str) -> bool {
        let cleared = self.conflicts.remove(resource_type, id).is_some();
        if cleared {
            log::info!("Cleared conflict for {}/{}", resource_type, id);
        }
        cleared
    }
}

/// Keep what we pushed unless the server answered with an object of its own
fn pushed_payload_or(sent: Value, answered: Value) -> Value {
    if answered.is_object() && sent.is_object() {
        answered
    } else {
        sent
    }
}

/// Shallow merge: server fields take precedence, except client-authoritative
/// fields which keep the client value. Non-object payloads resolve to the
/// server payload.
pub fn merge_payloads(client: &Value, server: &Value, client_authoritative: &[String]) -> Value {
    let (Value::Object(client_map), Value::Object(server_map)) = (client, server) else {
        return server.clone();
    };

    let mut merged: Map<String, Value> = client_map.clone();
    for (key, value) in server_map {
        if client_authoritative.iter().any(|f| f == key) && client_map.contains_key(key) {
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No open conflict for {0}")]
    NotFound(String),

    #[error("Manual resolution requires a payload")]
    ManualPayloadRequired,

    #[error("Push failed: {0}")]
    Api(#[from] ApiError),
}

// ============================================================================
// Tests
// ============================================================================
