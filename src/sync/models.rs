//! Sync Data Models
//!
//! Records owned by the offline store, task queue and conflict queue, plus
//! the result and state types reported to collaborators.
//!
//! Data Categories:
//! - StoredRecord: locally written entity, versioned and checksummed
//! - SyncTask: pending remote write with priority and retry budget
//! - ConflictRecord: divergence between a local write and the server
//! - DrainResult / SyncResult / EngineState: reporting

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

// ============================================================================
// Stored Records (Offline Store)
// ============================================================================

/// A locally mutated record awaiting sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub resource_type: String,
    pub payload: Value,

    /// When the local write happened
    pub local_timestamp: DateTime<Utc>,

    /// Monotonic per (resource_type, id)
    pub version: u64,

    /// SHA-256 of the serialized payload (hex)
    pub checksum: String,
}

impl StoredRecord {
    pub fn new(
        resource_type: &str,
        id: &str,
        payload: Value,
        local_timestamp: DateTime<Utc>,
        version: u64,
    ) -> Self {
        let checksum = compute_checksum(&payload);
        Self {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            payload,
            local_timestamp,
            version,
            checksum,
        }
    }

    /// Whether the checksum still matches the payload
    pub fn verify(&self) -> bool {
        compute_checksum(&self.payload) == self.checksum
    }

    /// Key used in the offline data map
    pub fn storage_key(&self) -> String {
        record_key(&self.resource_type, &self.id)
    }
}

/// `{resource_type}/{id}`
pub fn record_key(resource_type: &str, id: &str) -> String {
    format!("{}/{}", resource_type, id)
}

/// Content hash of a payload
///
/// `serde_json::Value` keeps object keys sorted, so equal payloads always
/// serialize identically.
pub fn compute_checksum(payload: &Value) -> String {
    let serialized = payload.to_string();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

// ============================================================================
// Sync Tasks (Task Queue)
// ============================================================================

/// Task priority; the queue drains `High` first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Remote write a task performs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Create { resource_type: String },
    Update { resource_type: String, id: String },
    Delete { resource_type: String, id: String },
    CustomAction { action: String },
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Create { .. } => "create",
            TaskKind::Update { .. } => "update",
            TaskKind::Delete { .. } => "delete",
            TaskKind::CustomAction { .. } => "custom-action",
        }
    }
}

/// A pending remote write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: String,
    pub kind: TaskKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,

    /// Insertion counter; breaks ties between tasks created in the same instant
    #[serde(default)]
    pub sequence: u64,

    /// Earliest time the next attempt may run (backoff)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncTask {
    pub fn new(
        kind: TaskKind,
        payload: Value,
        priority: Priority,
        max_retries: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            created_at,
            retry_count: 0,
            max_retries,
            priority,
            sequence: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Check if the task may run now
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }

    /// Whether another failure would exhaust the retry budget
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Exponential backoff for the current retry count
    pub fn backoff_delay(&self, base_secs: i64, max_secs: i64) -> Duration {
        let exponent = self.retry_count.min(30);
        let delay = base_secs
            .saturating_mul(2_i64.saturating_pow(exponent))
            .min(max_secs);
        Duration::seconds(delay.max(0))
    }
}

/// Queue ordering: priority desc, then created_at asc, then insertion order
pub fn queue_order(a: &SyncTask, b: &SyncTask) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.sequence.cmp(&b.sequence))
}

/// Final result of a task, delivered to whoever holds its receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed { attempts: u32, error: String },
}

// ============================================================================
// Conflict Resolution
// ============================================================================

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Push the client payload, overwriting the server
    ClientWins,

    /// Keep the server payload, dropping the pending local write
    ServerWins,

    /// Shallow merge; server fields win except client-authoritative ones
    Merge,

    /// Push a caller-supplied payload
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ClientWins => "client-wins",
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }
}

/// Detected divergence awaiting resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub resource_type: String,
    pub client_payload: Value,
    pub server_payload: Value,
    pub client_timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_modified_at: Option<DateTime<Utc>>,

    pub detected_at: DateTime<Utc>,
}

// ============================================================================
// Results & State
// ============================================================================

/// Outcome of one queue drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainResult {
    pub processed: usize,
    pub failed: usize,

    /// Tasks that failed but stay queued for a later drain
    pub retried: usize,

    /// True when another drain was already running and this call did nothing
    pub skipped: bool,
}

/// Outcome of one synchronization pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub synced: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub failed: usize,

    /// Entries dropped because their checksum no longer matched
    pub discarded: usize,

    /// True when another pass was already running and this call did nothing
    pub skipped: bool,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.errors == 0 && self.failed == 0
    }

    pub fn has_conflicts(&self) -> bool {
        self.conflicts > 0
    }

    /// Fold a queue drain into the pass totals
    pub fn absorb(&mut self, drain: DrainResult) {
        self.synced += drain.processed;
        self.failed += drain.failed;
    }
}

/// Snapshot published to UI / notification collaborators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    /// Platform network interface reports up
    pub is_online: bool,

    /// Health probe confirmed the server answers
    pub is_reachable: bool,

    pub pending_task_count: usize,
    pub sync_in_progress: bool,
    pub open_conflicts: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Tests
// ============================================================================
