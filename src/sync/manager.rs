//! Sync Coordinator - reconciles the offline store against the server
//!
//! A pass walks every verified offline store entry:
//! - server copy absent: create it, drop the local entry
//! - server modified after the local write: queue a conflict, keep the entry
//! - otherwise: push the local payload, drop the local entry
//!
//! and then drains the task queue. Only one pass runs at a time; the
//! coordinator owns no persistent state of its own.
//!
//! Triggers: reconnect (after a confirmed health probe), the background
//! scheduler, and explicit `force_sync`.

use super::api::SharedApi;
use super::conflict::{ConflictQueue, ConflictResolver};
use super::connectivity::{ConnectivityChange, ConnectivityMonitor, StateHub};
use super::models::{
    ConflictRecord, ConflictStrategy, EngineState, Priority, StoredRecord, SyncResult, TaskKind,
};
use super::queue::{QueueSettings, RunGuard, TaskQueue};
use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::db::SharedStore;
use crate::store::OfflineStore;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Per-entry result of a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Synced,
    Conflict,
    Error,
}

/// Publishes `sync_in_progress` for the lifetime of a pass, including one
/// whose future is dropped before completion
struct InProgress<'a>(&'a StateHub);

impl<'a> InProgress<'a> {
    fn mark(hub: &'a StateHub) -> Self {
        hub.update(|state| state.sync_in_progress = true);
        Self(hub)
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.update(|state| state.sync_in_progress = false);
    }
}

/// Sync coordinator - main orchestrator
#[derive(Clone)]
pub struct SyncCoordinator {
    api: SharedApi,
    clock: SharedClock,
    store: OfflineStore,
    queue: TaskQueue,
    conflicts: ConflictQueue,
    resolver: ConflictResolver,
    monitor: Arc<ConnectivityMonitor>,
    hub: StateHub,
    syncing: Arc<AtomicBool>,
}

impl SyncCoordinator {
    /// Wire the offline store, task queue and conflict queue over one storage backend
    pub fn new(storage: SharedStore, clock: SharedClock, api: SharedApi, config: &EngineConfig) -> Self {
        let hub = StateHub::new();
        let store = OfflineStore::new(storage.clone(), clock.clone());
        let queue = TaskQueue::new(
            storage.clone(),
            clock.clone(),
            api.clone(),
            hub.clone(),
            QueueSettings::from_config(config),
        );
        let conflicts = ConflictQueue::new(storage, hub.clone());
        let resolver = ConflictResolver::new(
            conflicts.clone(),
            store.clone(),
            api.clone(),
            clock.clone(),
            config.client_authoritative_fields.clone(),
        );
        let monitor = ConnectivityMonitor::new(
            api.clone(),
            Duration::from_secs(config.probe_timeout_secs),
            hub.clone(),
        );

        Self {
            api,
            clock,
            store,
            queue,
            conflicts,
            resolver,
            monitor: Arc::new(monitor),
            hub,
            syncing: Arc::new(AtomicBool::new(false)),
        }
    }

    // ========================================================================
    // Local writes
    // ========================================================================

    /// Record a local write for the next sync pass
    pub fn write(&self, resource_type: &str, id: &str, payload: Value) -> StoredRecord {
        self.store.store(resource_type, id, payload)
    }

    /// Queue a write-intent not tied to a stored entity
    pub fn enqueue(&self, kind: TaskKind, payload: Value, priority: Priority) -> String {
        let max_retries = self.queue.settings().default_max_retries;
        self.queue.enqueue(kind, payload, priority, max_retries)
    }

    // ========================================================================
    // Sync Operations
    // ========================================================================

    /// Run one reconciliation pass followed by a queue drain.
    ///
    /// Returns `skipped: true` immediately if a pass is already running.
    pub async fn synchronize(&self) -> SyncResult {
        let Some(_guard) = RunGuard::acquire(&self.syncing) else {
            log::debug!("Sync pass already in progress, skipping");
            return SyncResult {
                skipped: true,
                ..Default::default()
            };
        };

        let _in_progress = InProgress::mark(&self.hub);
        log::info!("Starting sync pass");

        let mut result = SyncResult::default();
        let (entries, discarded) = self.store.entries();
        result.discarded = discarded;

        for record in &entries {
            match self.reconcile(record).await {
                EntryOutcome::Synced => result.synced += 1,
                EntryOutcome::Conflict => result.conflicts += 1,
                EntryOutcome::Error => result.errors += 1,
            }
        }

        let drain = self.queue.drain().await;
        result.absorb(drain);

        let finished_at = self.clock.now();
        self.hub.update(|state| {
            state.sync_in_progress = false;
            state.last_sync_at = Some(finished_at);
        });

        log::info!(
            "Sync pass complete: {} synced, {} conflicts, {} errors, {} failed, {} discarded",
            result.synced, result.conflicts, result.errors, result.failed, result.discarded
        );
        result
    }

    /// Fetch, compare, then create / push / flag one entry
    async fn reconcile(&self, record: &StoredRecord) -> EntryOutcome {
        let (resource_type, id) = (record.resource_type.as_str(), record.id.as_str());

        let remote = match self.api.fetch(resource_type, id).await {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("Fetch failed for {}/{}, keeping local entry: {}", resource_type, id, e);
                return EntryOutcome::Error;
            }
        };

        let Some(remote) = remote else {
            return match self.api.create(resource_type, &record.payload).await {
                Ok(_) => {
                    log::debug!("Created {}/{} on server", resource_type, id);
                    self.finish_entry(record);
                    EntryOutcome::Synced
                }
                Err(e) => {
                    log::warn!("Create failed for {}/{}: {}", resource_type, id, e);
                    EntryOutcome::Error
                }
            };
        };

        let server_newer = remote
            .last_modified
            .map_or(false, |modified| modified > record.local_timestamp);

        if server_newer {
            log::info!(
                "Conflict on {}/{}: server modified {:?}, local write {}",
                resource_type, id, remote.last_modified, record.local_timestamp
            );
            self.conflicts.push(ConflictRecord {
                id: record.id.clone(),
                resource_type: record.resource_type.clone(),
                client_payload: record.payload.clone(),
                server_payload: remote.payload,
                client_timestamp: record.local_timestamp,
                server_modified_at: remote.last_modified,
                detected_at: self.clock.now(),
            });
            return EntryOutcome::Conflict;
        }

        match self.api.update(resource_type, id, &record.payload).await {
            Ok(_) => {
                log::debug!("Pushed {}/{} (version {})", resource_type, id, record.version);
                self.finish_entry(record);
                EntryOutcome::Synced
            }
            Err(e) => {
                log::warn!("Push failed for {}/{}, keeping local entry: {}", resource_type, id, e);
                EntryOutcome::Error
            }
        }
    }

    /// Drop a synced entry unless it was rewritten while the pass ran
    fn finish_entry(&self, synced: &StoredRecord) {
        let (resource_type, id) = (synced.resource_type.as_str(), synced.id.as_str());

        match self.store.record(resource_type, id) {
            Some(current) if current.version == synced.version => self.store.remove(resource_type, id),
            Some(_) => log::debug!("{}/{} changed during sync, keeping newer write", resource_type, id),
            None => {}
        }

        // An older conflict for this id no longer applies
        self.conflicts.remove(resource_type, id);
    }

    /// Probe the server, then run a pass. Errors when the server is unreachable.
    pub async fn force_sync(&self) -> Result<SyncResult, SyncError> {
        if !self.monitor.probe().await {
            self.hub.update(|state| state.is_reachable = false);
            log::warn!("Force sync requested but server is unreachable");
            return Err(SyncError::Offline);
        }

        self.hub.update(|state| {
            state.is_online = true;
            state.is_reachable = true;
        });
        Ok(self.synchronize().await)
    }

    /// Feed a platform online/offline signal. A confirmed reconnect runs a pass.
    pub async fn handle_network_event(&self, online: bool) -> Option<SyncResult> {
        match self.monitor.handle_network_event(online).await {
            ConnectivityChange::Reconnected => Some(self.synchronize().await),
            ConnectivityChange::Disconnected | ConnectivityChange::Unchanged => None,
        }
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    pub async fn resolve_conflict(
        &self,
        id: &str,
        resource_type: &str,
        strategy: ConflictStrategy,
        manual_payload: Option<Value>,
    ) -> bool {
        self.resolver.resolve(id, resource_type, strategy, manual_payload).await
    }

    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.resolver.conflicts()
    }

    // ========================================================================
    // State & Components
    // ========================================================================

    /// Current engine state snapshot
    pub fn state(&self) -> EngineState {
        self.hub.snapshot()
    }

    /// Notified on every state transition
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.hub.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &OfflineStore {
        &self.store
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Server unreachable")]
    Offline,
}

// ============================================================================
// Tests
// ============================================================================
