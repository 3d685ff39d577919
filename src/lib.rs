//! # offsync
//!
//! Offline synchronization engine: keeps a client working while its backend
//! is unreachable and reconciles once connectivity returns.
//!
//! - [`cache::ResponseCache`] - per-tag expiring cache of read results
//! - [`store::OfflineStore`] - versioned, checksummed local writes
//! - [`sync::TaskQueue`] - prioritized remote writes with bounded retry
//! - [`sync::SyncCoordinator`] - reconciliation passes and conflict routing
//! - [`sync::ConflictResolver`] - client-wins / server-wins / merge / manual

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod store;
pub mod sync;

pub use cache::{CachePolicy, CacheStats, CacheStrategy, ResponseCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::EngineConfig;
pub use db::{Database, KeyValueStore, MemoryStore, SharedStore, StorageError};
pub use store::OfflineStore;
pub use sync::{
    ApiError, BackgroundScheduler, ConflictStrategy, EngineState, HttpRemoteApi, Priority,
    SchedulerConfig, SchedulerError, SharedApi, SyncCoordinator, SyncResult, TaskKind,
};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const CONNECTIVITY_POLL_SECS: u64 = 30;

// ============================================================================
// Engine
// ============================================================================

/// All services wired over one storage backend and one remote API
#[derive(Clone)]
pub struct OfflineEngine {
    pub config: Arc<EngineConfig>,
    pub cache: ResponseCache,
    pub coordinator: SyncCoordinator,
    pub scheduler: BackgroundScheduler,
}

impl OfflineEngine {
    /// Open the SQLite store and HTTP client described by `config`
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let db_path = match &config.database_path {
            Some(path) => path.clone(),
            None => default_database_path()?,
        };
        log::info!("Database path: {:?}", db_path);

        let storage: SharedStore = Arc::new(Database::new(db_path)?);
        let api: SharedApi = Arc::new(HttpRemoteApi::new(&config)?);
        Ok(Self::with_parts(config, storage, clock::system_clock(), api))
    }

    /// Wire the engine over explicit backends
    pub fn with_parts(config: EngineConfig, storage: SharedStore, clock: SharedClock, api: SharedApi) -> Self {
        let cache = ResponseCache::new(storage.clone(), clock.clone(), config.cache_policies.clone());
        let coordinator = SyncCoordinator::new(storage.clone(), clock, api, &config);
        let scheduler = BackgroundScheduler::new(
            storage,
            coordinator.clone(),
            cache.clone(),
            SchedulerConfig {
                enabled: true,
                interval_minutes: config.sync_interval_minutes,
                last_run: None,
            },
            Duration::from_secs(60 * config.janitor_interval_minutes.max(1)),
        );

        Self {
            config: Arc::new(config),
            cache,
            coordinator,
            scheduler,
        }
    }

    /// Check connectivity and start the scheduler if enabled
    pub async fn start(&self) -> Result<(), EngineError> {
        let saved = match self.scheduler.load_config().await {
            Ok(saved) => saved,
            Err(e) => {
                log::warn!("Using configured scheduler settings, saved config unreadable: {}", e);
                false
            }
        };

        let scheduler_config = self.scheduler.get_config().await;
        if saved && scheduler_config.interval_minutes != self.config.sync_interval_minutes {
            log::info!(
                "Saved scheduler config overrides configured sync interval ({} minutes instead of {})",
                scheduler_config.interval_minutes,
                self.config.sync_interval_minutes
            );
        }
        if scheduler_config.enabled {
            log::info!(
                "Auto-starting background scheduler (interval: {} minutes)",
                scheduler_config.interval_minutes
            );
            self.scheduler.start().await?;
        }

        if let Some(result) = self.coordinator.handle_network_event(true).await {
            log::info!("Initial sync: {} synced, {} conflicts", result.synced, result.conflicts);
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        if self.scheduler.is_running() {
            // Ignore error if it stopped in between
            let _ = self.scheduler.stop().await;
        }
        let pending = self.coordinator.state().pending_task_count;
        log::info!("Engine stopped ({} tasks pending)", pending);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("API client error: {0}")]
    Api(#[from] ApiError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Cannot determine data directory (is HOME set?)")]
    NoDataDir,
}

fn default_database_path() -> Result<PathBuf, EngineError> {
    let dirs = directories::ProjectDirs::from("dev", "offsync", "offsync").ok_or(EngineError::NoDataDir)?;
    Ok(dirs.data_dir().join("offsync.db"))
}

// ============================================================================
// Application Entry Point
// ============================================================================

pub fn run() {
    // Load .env before reading OFFSYNC_* variables
    dotenvy::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EngineConfig::from_env();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        log::error!("Engine error: {}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}

/// Run headless until Ctrl-C, polling connectivity
async fn serve(config: EngineConfig) -> Result<(), EngineError> {
    let engine = OfflineEngine::open(config)?;
    engine.start().await?;

    let mut states = engine.coordinator.subscribe();
    let mut poll = tokio::time::interval(Duration::from_secs(CONNECTIVITY_POLL_SECS));

    loop {
        tokio::select! {
            _ = poll.tick() => {
                if let Some(result) = engine.coordinator.handle_network_event(true).await {
                    log::info!(
                        "Reconnect sync: {} synced, {} conflicts, {} failed",
                        result.synced, result.conflicts, result.failed
                    );
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                log::debug!(
                    "State: reachable={} pending={} syncing={} conflicts={}",
                    state.is_reachable, state.pending_task_count, state.sync_in_progress, state.open_conflicts
                );
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
