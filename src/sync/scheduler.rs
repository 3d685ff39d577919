//! Background Sync Scheduler
//!
//! Runs a sync pass at a configurable interval while the server is reachable,
//! and purges expired response-cache entries on its own (janitor) interval.
//! Uses Tokio tasks for non-blocking background execution.

use super::manager::SyncCoordinator;
use super::models::SyncResult;
use crate::cache::ResponseCache;
use crate::db::{self, SharedStore, StorageError};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

pub const MIN_INTERVAL_MINUTES: u64 = 1;
pub const MAX_INTERVAL_MINUTES: u64 = 1440;

/// Scheduler configuration persisted under `scheduler_config`
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 5,
            last_run: None,
        }
    }
}

/// Background scheduler for periodic sync and cache cleanup
#[derive(Clone)]
pub struct BackgroundScheduler {
    storage: SharedStore,
    coordinator: SyncCoordinator,
    cache: ResponseCache,
    janitor_interval: Duration,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task: Arc<StdMutex<Option<LoopTask>>>,
}

/// Spawned scheduler loop and the channel that asks it to exit
struct LoopTask {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} minutes, got {}",
            MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, interval_minutes
        )));
    }
    Ok(())
}

impl BackgroundScheduler {
    /// Create new scheduler instance
    pub fn new(
        storage: SharedStore,
        coordinator: SyncCoordinator,
        cache: ResponseCache,
        config: SchedulerConfig,
        janitor_interval: Duration,
    ) -> Self {
        Self {
            storage,
            coordinator,
            cache,
            janitor_interval,
            config: Arc::new(RwLock::new(config)),
            running: Arc::new(AtomicBool::new(false)),
            task: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from storage (keeps the current one if none saved).
    /// Returns whether a saved configuration was applied.
    pub async fn load_config(&self) -> Result<bool, SchedulerError> {
        match db::read_json::<SchedulerConfig>(self.storage.as_ref(), db::SCHEDULER_CONFIG_KEY)? {
            Some(config) => {
                *self.config.write().await = config;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Save configuration to storage
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        db::write_json(self.storage.as_ref(), db::SCHEDULER_CONFIG_KEY, &config)?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            scheduler.scheduler_loop(interval_minutes, stop_rx).await;
        });

        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(LoopTask { handle, stop_tx });

        log::info!("Background scheduler started (interval: {} minutes)", interval_minutes);
        Ok(())
    }

    /// Stop background scheduler task. A sync pass already under way is
    /// allowed to finish before this returns.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(SchedulerError::NotRunning);
        }

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.stop_tx.send(true);
            if let Err(e) = task.handle.await {
                log::error!("Scheduler loop ended abnormally: {}", e);
            }
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get current configuration
    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration, persist it, and restart if needed
    pub async fn update_config(&self, enabled: bool, interval_minutes: u64) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }

        if let Err(e) = self.save_config().await {
            log::warn!("Scheduler config not persisted: {}", e);
        }

        if self.is_running() {
            // Ignore error if it stopped in between
            let _ = self.stop().await;
        }

        if enabled {
            self.start().await?;
        }

        log::info!("Scheduler config updated: enabled={}, interval={} minutes", enabled, interval_minutes);
        Ok(())
    }

    /// One scheduled sync: runs only while the server is reachable
    pub async fn run_scheduled_sync(&self) -> Option<SyncResult> {
        if !self.coordinator.state().is_reachable {
            log::debug!("Scheduled sync skipped: server not reachable");
            return None;
        }

        log::info!("Background sync triggered by scheduler");
        let result = self.coordinator.synchronize().await;

        if !result.skipped {
            {
                let mut config = self.config.write().await;
                config.last_run = Some(Utc::now());
            }
            if let Err(e) = self.save_config().await {
                log::warn!("Failed to save last_run timestamp: {}", e);
            }
        }

        if result.has_conflicts() {
            log::warn!("Background sync left {} conflicts for resolution", result.conflicts);
        }
        Some(result)
    }

    /// One janitor pass over the response cache
    pub async fn run_janitor(&self) -> usize {
        self.cache.purge_expired().await
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(&self, interval_minutes: u64, mut stop_rx: watch::Receiver<bool>) {
        let mut sync_interval = tokio::time::interval(Duration::from_secs(60 * interval_minutes));
        let mut janitor_interval = tokio::time::interval(self.janitor_interval.max(Duration::from_secs(1)));

        log::info!("Scheduler loop started (interval: {} minutes)", interval_minutes);

        loop {
            tokio::select! {
                biased;

                // Sender dropped counts as a stop request too
                _ = stop_rx.changed() => break,
                _ = sync_interval.tick() => {
                    self.run_scheduled_sync().await;
                }
                _ = janitor_interval.tick() => {
                    self.run_janitor().await;
                }
            }
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
