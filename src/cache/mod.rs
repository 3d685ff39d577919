//! Response cache - per-tag expiring store for previously fetched reads
//!
//! Two tiers:
//! - moka in-memory layer per tag (bounded by the tag's `max_entries`)
//! - per-tag response map, loaded from `cache:{tag}` on first use and
//!   written back after every change
//!
//! The response maps held in memory are authoritative for the running
//! process. Persistence is best effort: a storage failure is logged and
//! never reaches the caller, and never resurrects invalidated entries.
//!
//! Expiry is checked lazily on every `get` against the tag's `max_age_seconds`;
//! [`ResponseCache::purge_expired`] is the janitor pass that bounds storage.

use crate::clock::SharedClock;
use crate::db::{self, SharedStore, StorageResult};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Declarative fetch strategy for a tag
///
/// The cache only records it; callers decide when to consult the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    NetworkFirst,
    CacheFirst,
    Revalidate,
}

/// Expiry and size policy for a cache tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub strategy: CacheStrategy,
    pub max_entries: usize,
    pub max_age_seconds: u64,
}

impl CachePolicy {
    pub fn new(strategy: CacheStrategy, max_entries: usize, max_age_seconds: u64) -> Self {
        Self {
            strategy,
            max_entries,
            max_age_seconds,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(CacheStrategy::NetworkFirst, 100, 300)
    }
}

/// A cached read result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub resource_key: String,
    pub body: Value,
    pub cached_at: DateTime<Utc>,
    pub tag: String,
}

impl CachedResponse {
    /// Expired once strictly older than `max_age_seconds`
    pub fn is_expired(&self, policy: &CachePolicy, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.cached_at);
        age.num_milliseconds() > (policy.max_age_seconds as i64).saturating_mul(1000)
    }
}

type ResponseMap = HashMap<String, CachedResponse>;

/// Response maps for the tags touched so far
#[derive(Default)]
struct TagMaps {
    maps: HashMap<String, ResponseMap>,

    /// Set when `invalidate_all` could not clear storage; tags not yet
    /// loaded then start empty instead of reading the stale durable map
    durable_stale: bool,
}

/// Response cache with per-tag policies
#[derive(Clone)]
pub struct ResponseCache {
    storage: SharedStore,
    clock: SharedClock,
    policies: Arc<HashMap<String, CachePolicy>>,
    hot: Arc<Mutex<HashMap<String, Cache<String, CachedResponse>>>>,
    entries: Arc<Mutex<TagMaps>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ResponseCache {
    pub fn new(storage: SharedStore, clock: SharedClock, policies: HashMap<String, CachePolicy>) -> Self {
        Self {
            storage,
            clock,
            policies: Arc::new(policies),
            hot: Arc::new(Mutex::new(HashMap::new())),
            entries: Arc::new(Mutex::new(TagMaps::default())),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Policy for a tag (`api` policy for unknown tags)
    pub fn policy(&self, tag: &str) -> CachePolicy {
        self.policies
            .get(tag)
            .or_else(|| self.policies.get("api"))
            .cloned()
            .unwrap_or_default()
    }

    /// Get a cached body, or `None` when missing or older than the tag's max age
    pub async fn get(&self, resource_key: &str, tag: &str) -> Option<Value> {
        let policy = self.policy(tag);
        let now = self.clock.now();
        let hot = self.hot_layer(tag, &policy);

        if let Some(entry) = hot.get(resource_key).await {
            if !entry.is_expired(&policy, now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.body);
            }
            hot.invalidate(resource_key).await;
        }

        let found = self.with_map(tag, |map| match map.get(resource_key).cloned() {
            Some(entry) if !entry.is_expired(&policy, now) => (Some(entry), false),
            Some(_) => {
                // Expired: drop it while we're here
                map.remove(resource_key);
                (None, true)
            }
            None => (None, false),
        });

        match found {
            Some(entry) => {
                hot.insert(resource_key.to_string(), entry.clone()).await;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.body)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a body, replacing any existing entry for the key
    pub async fn put(&self, resource_key: &str, body: Value, tag: &str) {
        let policy = self.policy(tag);
        let entry = CachedResponse {
            resource_key: resource_key.to_string(),
            body,
            cached_at: self.clock.now(),
            tag: tag.to_string(),
        };

        let hot = self.hot_layer(tag, &policy);
        hot.insert(resource_key.to_string(), entry.clone()).await;

        let evicted = self.with_map(tag, |map| {
            map.insert(resource_key.to_string(), entry);
            (evict_oldest(map, policy.max_entries), true)
        });

        for key in &evicted {
            hot.invalidate(key).await;
        }
    }

    /// Remove a single entry
    pub async fn remove(&self, resource_key: &str, tag: &str) {
        let policy = self.policy(tag);
        self.hot_layer(tag, &policy).invalidate(resource_key).await;

        self.with_map(tag, |map| {
            let removed = map.remove(resource_key).is_some();
            (removed, removed)
        });
    }

    /// Drop every cached response across all tags
    pub async fn invalidate_all(&self) {
        let layers = self.hot_layers();
        futures::future::join_all(layers.iter().map(|layer| {
            layer.invalidate_all();
            layer.run_pending_tasks()
        }))
        .await;

        let mut entries = self.lock_entries();
        entries.maps.clear();
        entries.durable_stale = true;

        match self.storage.keys_with_prefix(db::CACHE_KEY_PREFIX) {
            Ok(keys) => {
                let mut cleared = true;
                for key in keys {
                    if let Err(e) = self.storage.remove(&key) {
                        log::warn!("Failed to clear cache key '{}': {}", key, e);
                        cleared = false;
                    }
                }
                entries.durable_stale = !cleared;
            }
            Err(e) => log::warn!("Failed to list cache keys: {}", e),
        }

        log::info!("Response cache invalidated");
    }

    /// Janitor pass: remove expired entries from every tag. Returns the
    /// number of entries purged.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;

        for tag in self.known_tags() {
            let policy = self.policy(&tag);
            let expired = self.with_map(&tag, |map| {
                let expired: Vec<String> = map
                    .iter()
                    .filter(|(_, entry)| entry.is_expired(&policy, now))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in &expired {
                    map.remove(k);
                }
                let dirty = !expired.is_empty();
                (expired, dirty)
            });

            if expired.is_empty() {
                continue;
            }

            let hot = self.hot_layer(&tag, &policy);
            for k in &expired {
                hot.invalidate(k).await;
            }
            purged += expired.len();
        }

        if purged > 0 {
            log::info!("Cache janitor purged {} expired entries", purged);
        }
        purged
    }

    /// Cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests > 0 {
            (hits as f64 / total_requests as f64) * 100.0
        } else {
            0.0
        };

        let entry_count = self
            .known_tags()
            .iter()
            .map(|tag| self.with_map(tag, |map| (map.len() as u64, false)))
            .sum();

        CacheStats {
            hits,
            misses,
            total_requests,
            hit_rate,
            entry_count,
        }
    }

    /// Reset cache statistics
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Run `change` against a tag's response map, loading it on first use.
    /// The closure returns its result and whether the map must be persisted.
    fn with_map<R>(&self, tag: &str, change: impl FnOnce(&mut ResponseMap) -> (R, bool)) -> R {
        let mut entries = self.lock_entries();
        let durable_stale = entries.durable_stale;
        let map = entries.maps.entry(tag.to_string()).or_insert_with(|| {
            if durable_stale {
                ResponseMap::new()
            } else {
                db::read_json_or_default(self.storage.as_ref(), &db::cache_key(tag))
            }
        });

        let (result, dirty) = change(map);
        if dirty {
            if let Err(e) = self.persist(tag, map) {
                log::warn!("Cache write for tag '{}' kept in memory only: {}", tag, e);
            }
        }
        result
    }

    /// Tags held in memory plus tags present in storage
    fn known_tags(&self) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = self.lock_entries().maps.keys().cloned().collect();
        match self.storage.keys_with_prefix(db::CACHE_KEY_PREFIX) {
            Ok(keys) => tags.extend(keys.iter().map(|key| key[db::CACHE_KEY_PREFIX.len()..].to_string())),
            Err(e) => log::warn!("Could not list cache tags: {}", e),
        }
        tags
    }

    fn hot_layer(&self, tag: &str, policy: &CachePolicy) -> Cache<String, CachedResponse> {
        let mut layers = self.hot.lock().unwrap_or_else(|e| e.into_inner());
        layers
            .entry(tag.to_string())
            .or_insert_with(|| {
                Cache::builder()
                    .max_capacity(policy.max_entries.max(1) as u64)
                    .time_to_live(Duration::from_secs(policy.max_age_seconds.max(1)))
                    .build()
            })
            .clone()
    }

    fn hot_layers(&self) -> Vec<Cache<String, CachedResponse>> {
        self.hot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, TagMaps> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, tag: &str, map: &ResponseMap) -> StorageResult<()> {
        let key = db::cache_key(tag);
        if map.is_empty() {
            self.storage.remove(&key)
        } else {
            db::write_json(self.storage.as_ref(), &key, map)
        }
    }
}

/// Keep at most `max_entries`, dropping the oldest first. Returns the
/// dropped keys.
fn evict_oldest(map: &mut ResponseMap, max_entries: usize) -> Vec<String> {
    let mut evicted = Vec::new();
    while map.len() > max_entries {
        let oldest = map
            .iter()
            .min_by_key(|(_, entry)| entry.cached_at)
            .map(|(k, _)| k.clone());
        match oldest {
            Some(key) => {
                map.remove(&key);
                evicted.push(key);
            }
            None => break,
        }
    }
    evicted
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Total cache requests
    pub total_requests: u64,

    /// Cache hit rate (percentage)
    pub hit_rate: f64,

    /// Entries held in durable storage
    pub entry_count: u64,
}
