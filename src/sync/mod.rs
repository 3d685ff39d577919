//! Sync Module - Offline Write Reconciliation
//!
//! Keeps local writes flowing to the server across disconnects:
//! - Task queue of pending remote writes (priority, retry, backoff)
//! - Sync coordinator reconciling the offline store on reconnect / timer
//! - Conflict queue and resolver (client-wins, server-wins, merge, manual)
//! - Connectivity probing and observable engine state
//!
//! Architecture:
//! - Single client replaying against one authoritative server
//! - Conflicts detected by comparing the server's last-modified marker with
//!   the local write time
//! - Every service is constructed explicitly over an injected storage backend

pub mod api;
pub mod conflict;
pub mod connectivity;
pub mod manager;
pub mod models;
pub mod queue;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod fake;
#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use models::{
    ConflictRecord, ConflictStrategy, DrainResult, EngineState, Priority, StoredRecord,
    SyncResult, SyncTask, TaskKind, TaskOutcome,
};

pub use api::{ApiError, HttpRemoteApi, RemoteApi, RemoteRecord, SharedApi};
pub use conflict::{merge_payloads, ConflictQueue, ConflictResolver, ResolveError};
pub use connectivity::{ConnectivityChange, ConnectivityMonitor, StateHub};
pub use manager::{SyncCoordinator, SyncError};
pub use queue::{QueueError, QueueSettings, QueueStats, TaskQueue};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
