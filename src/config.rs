//! Engine Configuration
//!
//! Defaults suit a client talking to a single REST backend. Every field can
//! be overridden through `OFFSYNC_*` environment variables (a `.env` file is
//! loaded first by [`crate::run`]).

use crate::cache::{CachePolicy, CacheStrategy};
use crate::sync::scheduler::{MAX_INTERVAL_MINUTES, MIN_INTERVAL_MINUTES};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the authoritative server (routes live under `/api`)
    pub api_base_url: String,

    /// Optional bearer token sent with every request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,

    /// Client identifier reported in the `X-Client-Id` header
    pub client_id: String,

    /// Per-request timeout for remote writes and fetches
    pub request_timeout_secs: u64,

    /// Upper bound for the reachability probe; timeout means "not connected"
    pub probe_timeout_secs: u64,

    /// Periodic sync interval while connected (1-1440 minutes)
    pub sync_interval_minutes: u64,

    /// How often the cache janitor purges expired entries
    pub janitor_interval_minutes: u64,

    /// Retry budget for tasks enqueued without an explicit one
    pub default_max_retries: u32,

    /// Exponential backoff: base delay and cap
    pub retry_base_delay_secs: i64,
    pub retry_max_delay_secs: i64,

    /// Whether the host schedules drains itself. When false, every enqueue
    /// triggers a debounced drain.
    pub background_sync_available: bool,
    pub immediate_drain_debounce_ms: u64,

    /// Payload field carrying the server's last-modified marker
    pub last_modified_field: String,

    /// Fields the client owns during a `merge` resolution
    pub client_authoritative_fields: Vec<String>,

    /// SQLite file; `None` picks the platform data directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    /// Response cache policies keyed by tag
    pub cache_policies: HashMap<String, CachePolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            api_token: None,
            client_id: default_client_id(),
            request_timeout_secs: 30,
            probe_timeout_secs: 5,
            sync_interval_minutes: 5,
            janitor_interval_minutes: 15,
            default_max_retries: 5,
            retry_base_delay_secs: 30,  // Initial retry delay: 30 seconds
            retry_max_delay_secs: 3600, // Max retry delay: 1 hour
            background_sync_available: true,
            immediate_drain_debounce_ms: 500,
            last_modified_field: "updated_at".to_string(),
            client_authoritative_fields: vec!["preferences".to_string()],
            database_path: None,
            cache_policies: default_cache_policies(),
        }
    }
}

impl EngineConfig {
    /// Build a config from `OFFSYNC_*` environment variables on top of the
    /// defaults. Unparseable values keep the default and log a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("OFFSYNC_API_BASE_URL") {
            config.api_base_url = url;
        }
        if let Ok(token) = std::env::var("OFFSYNC_API_TOKEN") {
            if !token.is_empty() {
                config.api_token = Some(token);
            }
        }
        if let Ok(id) = std::env::var("OFFSYNC_CLIENT_ID") {
            config.client_id = id;
        }
        if let Ok(path) = std::env::var("OFFSYNC_DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Ok(field) = std::env::var("OFFSYNC_LAST_MODIFIED_FIELD") {
            config.last_modified_field = field;
        }
        if let Ok(fields) = std::env::var("OFFSYNC_CLIENT_AUTHORITATIVE_FIELDS") {
            config.client_authoritative_fields = fields
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect();
        }

        env_parse("OFFSYNC_REQUEST_TIMEOUT_SECS", &mut config.request_timeout_secs);
        env_parse("OFFSYNC_PROBE_TIMEOUT_SECS", &mut config.probe_timeout_secs);
        env_parse_in_range(
            "OFFSYNC_SYNC_INTERVAL_MINUTES",
            &mut config.sync_interval_minutes,
            MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES,
        );
        env_parse_in_range(
            "OFFSYNC_JANITOR_INTERVAL_MINUTES",
            &mut config.janitor_interval_minutes,
            MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES,
        );
        env_parse("OFFSYNC_DEFAULT_MAX_RETRIES", &mut config.default_max_retries);
        env_parse("OFFSYNC_RETRY_BASE_DELAY_SECS", &mut config.retry_base_delay_secs);
        env_parse("OFFSYNC_RETRY_MAX_DELAY_SECS", &mut config.retry_max_delay_secs);
        env_parse("OFFSYNC_BACKGROUND_SYNC", &mut config.background_sync_available);
        env_parse("OFFSYNC_DRAIN_DEBOUNCE_MS", &mut config.immediate_drain_debounce_ms);

        config
    }
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => log::warn!("Ignoring invalid value for {}: {:?}", name, raw),
        }
    }
}

fn env_parse_in_range<T: FromStr + PartialOrd + Debug>(name: &str, target: &mut T, range: RangeInclusive<T>) {
    if let Ok(raw) = std::env::var(name) {
        match parse_in_range(&raw, &range) {
            Some(value) => *target = value,
            None => log::warn!(
                "Ignoring invalid value for {}: {:?} (expected {:?}), keeping {:?}",
                name, raw, range, target
            ),
        }
    }
}

fn parse_in_range<T: FromStr + PartialOrd>(raw: &str, range: &RangeInclusive<T>) -> Option<T> {
    raw.trim().parse::<T>().ok().filter(|value| range.contains(value))
}

/// Client identifier from hostname
fn default_client_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("client-{}", uuid::Uuid::new_v4()))
}

/// Built-in cache tags
pub fn default_cache_policies() -> HashMap<String, CachePolicy> {
    let mut policies = HashMap::new();
    policies.insert(
        "api".to_string(),
        CachePolicy::new(CacheStrategy::NetworkFirst, 100, 5 * 60),
    );
    policies.insert(
        "static".to_string(),
        CachePolicy::new(CacheStrategy::CacheFirst, 60, 30 * 24 * 60 * 60),
    );
    policies.insert(
        "images".to_string(),
        CachePolicy::new(CacheStrategy::CacheFirst, 60, 30 * 24 * 60 * 60),
    );
    policies.insert(
        "documents".to_string(),
        CachePolicy::new(CacheStrategy::Revalidate, 50, 24 * 60 * 60),
    );
    policies
}
