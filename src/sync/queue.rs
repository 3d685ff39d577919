//! Task Queue - pending remote writes with priority and bounded retry
//!
//! Writes that must reach the server (create/update/delete/custom actions)
//! are queued locally and executed by `drain`.
//!
//! Features:
//! - Persistent queue, re-sorted on every insert (priority desc, FIFO within a tier)
//! - At most one active drain; overlapping calls return immediately
//! - Exponential backoff between attempts (`next_attempt_at`)
//! - Max retry limit per task, exhausted tasks move to a dead-letter list
//! - Per-task outcome channel (`enqueue_with_receipt`)
//! - Debounced immediate drain when no background scheduler is available

use super::api::{ApiError, SharedApi};
use super::connectivity::StateHub;
use super::models::{queue_order, DrainResult, Priority, SyncTask, TaskKind, TaskOutcome};
use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::db::{self, SharedStore, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

// ============================================================================
// Settings
// ============================================================================

/// Retry and scheduling knobs for the queue
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub default_max_retries: u32,
    pub retry_base_delay_secs: i64,
    pub retry_max_delay_secs: i64,
    pub background_sync_available: bool,
    pub immediate_drain_debounce: Duration,
}

impl QueueSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            default_max_retries: config.default_max_retries,
            retry_base_delay_secs: config.retry_base_delay_secs,
            retry_max_delay_secs: config.retry_max_delay_secs,
            background_sync_available: config.background_sync_available,
            immediate_drain_debounce: Duration::from_millis(config.immediate_drain_debounce_ms),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_max_retries: 5,
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 3600,
            background_sync_available: true,
            immediate_drain_debounce: Duration::from_millis(500),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: usize,
    /// Pending tasks whose backoff has elapsed
    pub due_count: usize,
    /// Pending tasks that already failed at least once
    pub retrying_count: usize,
    pub dead_letter_count: usize,
}

// ============================================================================
// Task Queue
// ============================================================================

struct QueueInner {
    storage: SharedStore,
    clock: SharedClock,
    api: SharedApi,
    hub: StateHub,
    settings: QueueSettings,
    tasks: Mutex<Vec<SyncTask>>,
    dead_letters: Mutex<Vec<SyncTask>>,
    receipts: Mutex<HashMap<String, oneshot::Sender<TaskOutcome>>>,
    next_sequence: AtomicU64,
    draining: AtomicBool,
    drain_generation: AtomicU64,
}

/// Persistent priority queue of remote writes
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

/// Holds an in-progress flag; cleared on drop
pub(crate) struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    /// `None` if the flag is already held
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TaskQueue {
    /// Open the queue, restoring persisted tasks and dead letters
    pub fn new(
        storage: SharedStore,
        clock: SharedClock,
        api: SharedApi,
        hub: StateHub,
        settings: QueueSettings,
    ) -> Self {
        let mut tasks: Vec<SyncTask> = db::read_json_or_default(storage.as_ref(), db::TASK_QUEUE_KEY);
        let dead_letters: Vec<SyncTask> = db::read_json_or_default(storage.as_ref(), db::DEAD_LETTER_KEY);
        tasks.sort_by(queue_order);

        let next_sequence = tasks
            .iter()
            .chain(dead_letters.iter())
            .map(|t| t.sequence + 1)
            .max()
            .unwrap_or(0);

        if !tasks.is_empty() {
            log::info!("Task queue restored {} pending tasks", tasks.len());
        }
        let pending = tasks.len();
        hub.update(|state| state.pending_task_count = pending);

        Self {
            inner: Arc::new(QueueInner {
                storage,
                clock,
                api,
                hub,
                settings,
                tasks: Mutex::new(tasks),
                dead_letters: Mutex::new(dead_letters),
                receipts: Mutex::new(HashMap::new()),
                next_sequence: AtomicU64::new(next_sequence),
                draining: AtomicBool::new(false),
                drain_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Queue a remote write, returning its task id
    pub fn enqueue(&self, kind: TaskKind, payload: Value, priority: Priority, max_retries: u32) -> String {
        let task = SyncTask::new(kind, payload, priority, max_retries, self.inner.clock.now());
        self.insert(task)
    }

    /// Queue a remote write and receive its final outcome on a channel.
    ///
    /// The receiver errors if the task is cancelled or the queue is dropped
    /// before the task completes.
    pub fn enqueue_with_receipt(
        &self,
        kind: TaskKind,
        payload: Value,
        priority: Priority,
        max_retries: u32,
    ) -> (String, oneshot::Receiver<TaskOutcome>) {
        let task = SyncTask::new(kind, payload, priority, max_retries, self.inner.clock.now());
        let (sender, receiver) = oneshot::channel();
        self.lock_receipts().insert(task.id.clone(), sender);
        (self.insert(task), receiver)
    }

    fn insert(&self, mut task: SyncTask) -> String {
        task.sequence = self.inner.next_sequence.fetch_add(1, Ordering::SeqCst);
        let id = task.id.clone();

        log::info!(
            "Queued {} task {} (priority: {}, max retries: {})",
            task.kind.label(), id, task.priority.as_str(), task.max_retries
        );

        {
            let mut tasks = self.lock_tasks();
            tasks.push(task);
            tasks.sort_by(queue_order);
        }
        self.persist_or_log();
        self.publish_pending();

        if !self.inner.settings.background_sync_available {
            self.schedule_immediate_drain();
        }
        id
    }

    /// Execute every due task once, in queue order.
    ///
    /// Returns `skipped: true` with zero counts if another drain is running.
    pub async fn drain(&self) -> DrainResult {
        let Some(_guard) = RunGuard::acquire(&self.inner.draining) else {
            log::debug!("Drain already in progress, skipping");
            return DrainResult {
                skipped: true,
                ..Default::default()
            };
        };

        let now = self.inner.clock.now();
        let due: Vec<SyncTask> = self
            .lock_tasks()
            .iter()
            .filter(|task| task.is_due(now))
            .cloned()
            .collect();

        if due.is_empty() {
            return DrainResult::default();
        }

        log::info!("Draining {} due tasks", due.len());
        let mut result = DrainResult::default();

        for task in due {
            match self.execute(&task).await {
                Ok(()) => {
                    log::debug!("Task {} ({}) completed", task.id, task.kind.label());
                    self.take_task(&task.id);
                    self.notify(&task.id, TaskOutcome::Completed);
                    result.processed += 1;
                }
                Err(e) => {
                    if self.record_failure(&task, &e) {
                        result.failed += 1;
                    } else {
                        result.retried += 1;
                    }
                }
            }
            self.persist_or_log();
        }

        self.publish_pending();
        log::info!(
            "Drain complete: {} processed, {} failed, {} awaiting retry",
            result.processed, result.failed, result.retried
        );
        result
    }

    /// Dispatch a task to the matching remote write
    async fn execute(&self, task: &SyncTask) -> Result<(), ApiError> {
        let api = &self.inner.api;
        match &task.kind {
            TaskKind::Create { resource_type } => {
                api.create(resource_type, &task.payload).await.map(drop)
            }
            TaskKind::Update { resource_type, id } => {
                api.update(resource_type, id, &task.payload).await.map(drop)
            }
            TaskKind::Delete { resource_type, id } => api.delete(resource_type, id).await,
            TaskKind::CustomAction { action } => {
                api.custom_action(action, &task.payload).await.map(drop)
            }
        }
    }

    /// Apply a failed attempt. Returns true when the task is now dead.
    ///
    /// Errors a retry cannot fix (4xx other than 429) skip the remaining
    /// attempts.
    fn record_failure(&self, task: &SyncTask, failure: &ApiError) -> bool {
        let attempts = task.retry_count + 1;
        let error = failure.to_string();

        if task.retries_exhausted() || !failure.is_transient() {
            if failure.is_transient() {
                log::error!(
                    "Task {} ({}) failed after {} attempts, moving to dead letters: {}",
                    task.id, task.kind.label(), attempts, error
                );
            } else {
                log::error!(
                    "Task {} ({}) rejected by server, moving to dead letters: {}",
                    task.id, task.kind.label(), error
                );
            }
            if let Some(mut dead) = self.take_task(&task.id) {
                dead.last_error = Some(error.clone());
                dead.next_attempt_at = None;
                self.lock_dead_letters().push(dead);
            }
            self.notify(&task.id, TaskOutcome::Failed { attempts, error });
            return true;
        }

        let settings = &self.inner.settings;
        let delay = task.backoff_delay(settings.retry_base_delay_secs, settings.retry_max_delay_secs);
        let retry_at = self.inner.clock.now() + delay;

        let mut tasks = self.lock_tasks();
        if let Some(queued) = tasks.iter_mut().find(|t| t.id == task.id) {
            queued.retry_count += 1;
            queued.next_attempt_at = Some(retry_at);
            queued.last_error = Some(error.clone());
            log::warn!(
                "Task {} failed (attempt {}/{}), retrying after {}: {}",
                task.id, attempts, task.max_retries + 1, retry_at, error
            );
        }
        false
    }

    /// Cancel a pending task
    pub fn cancel(&self, task_id: &str) -> Result<SyncTask, QueueError> {
        let task = self
            .take_task(task_id)
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;
        self.lock_receipts().remove(task_id);
        self.persist_or_log();
        self.publish_pending();
        log::info!("Cancelled task {}", task_id);
        Ok(task)
    }

    /// Snapshot of pending tasks in execution order
    pub fn pending(&self) -> Vec<SyncTask> {
        self.lock_tasks().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        let now = self.inner.clock.now();
        let tasks = self.lock_tasks();
        QueueStats {
            pending_count: tasks.len(),
            due_count: tasks.iter().filter(|t| t.is_due(now)).count(),
            retrying_count: tasks.iter().filter(|t| t.retry_count > 0).count(),
            dead_letter_count: self.lock_dead_letters().len(),
        }
    }

    /// Tasks that exhausted their retries
    pub fn dead_letters(&self) -> Vec<SyncTask> {
        self.lock_dead_letters().clone()
    }

    /// Reset dead tasks and put them back in the queue (manual retry)
    pub fn retry_dead_letters(&self) -> usize {
        let revived: Vec<SyncTask> = self.lock_dead_letters().drain(..).collect();
        let count = revived.len();

        {
            let mut tasks = self.lock_tasks();
            for mut task in revived {
                task.retry_count = 0;
                task.next_attempt_at = None;
                task.last_error = None;
                task.sequence = self.inner.next_sequence.fetch_add(1, Ordering::SeqCst);
                tasks.push(task);
            }
            tasks.sort_by(queue_order);
        }

        self.persist_or_log();
        self.publish_pending();
        log::info!("Reset {} dead tasks for retry", count);
        count
    }

    /// Drop every dead task
    pub fn clear_dead_letters(&self) -> usize {
        let count = {
            let mut dead = self.lock_dead_letters();
            let count = dead.len();
            dead.clear();
            count
        };
        self.persist_or_log();
        log::info!("Cleared {} dead tasks", count);
        count
    }

    /// Coalesce bursts of enqueues into one drain after the debounce window
    fn schedule_immediate_drain(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!("No async runtime, immediate drain deferred");
            return;
        };

        let generation = self.inner.drain_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let queue = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(queue.inner.settings.immediate_drain_debounce).await;
            if queue.inner.drain_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if queue.drain().await.skipped {
                queue.schedule_immediate_drain();
            }
        });
    }

    fn take_task(&self, task_id: &str) -> Option<SyncTask> {
        let mut tasks = self.lock_tasks();
        let index = tasks.iter().position(|t| t.id == task_id)?;
        Some(tasks.remove(index))
    }

    fn notify(&self, task_id: &str, outcome: TaskOutcome) {
        if let Some(sender) = self.lock_receipts().remove(task_id) {
            // Receiver may have been dropped
            let _ = sender.send(outcome);
        }
    }

    fn publish_pending(&self) {
        let pending = self.len();
        self.inner.hub.update(|state| state.pending_task_count = pending);
    }

    fn persist(&self) -> Result<(), QueueError> {
        let tasks = self.pending();
        let dead_letters = self.dead_letters();
        db::write_json(self.inner.storage.as_ref(), db::TASK_QUEUE_KEY, &tasks)?;
        db::write_json(self.inner.storage.as_ref(), db::DEAD_LETTER_KEY, &dead_letters)?;
        Ok(())
    }

    fn persist_or_log(&self) {
        if let Err(e) = self.persist() {
            log::warn!("Task queue kept in memory only: {}", e);
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<SyncTask>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_dead_letters(&self) -> std::sync::MutexGuard<'_, Vec<SyncTask>> {
        self.inner.dead_letters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_receipts(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<TaskOutcome>>> {
        self.inner.receipts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Task not found: {0}")]
    TaskNotFound(String),
}

// ============================================================================
// Tests
// ============================================================================
