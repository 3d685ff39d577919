//! Scripted in-memory server used by the sync tests

use super::api::{extract_last_modified, ApiError, RemoteApi, RemoteRecord};
use super::models::record_key;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct FakeApi {
    records: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<String>>,
    fail_writes: AtomicBool,
    reject_writes: AtomicBool,
    fail_fetches: AtomicBool,
    reachable: AtomicBool,
    write_delay_ms: AtomicU64,
    probe_delay_ms: AtomicU64,
    health_checks: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            reject_writes: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            write_delay_ms: AtomicU64::new(0),
            probe_delay_ms: AtomicU64::new(0),
            health_checks: AtomicUsize::new(0),
        }
    }

    pub fn put_record(&self, resource_type: &str, id: &str, payload: Value) {
        self.records
            .lock()
            .unwrap()
            .insert(record_key(resource_type, id), payload);
    }

    pub fn record(&self, resource_type: &str, id: &str) -> Option<Value> {
        self.records
            .lock()
            .unwrap()
            .get(&record_key(resource_type, id))
            .cloned()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Writes answer 422, which no retry can fix
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.probe_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Remote calls in the order they were made, e.g. `PUT /api/notes/1`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of write attempts (successful or not)
    pub fn write_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| !c.starts_with("GET"))
            .count()
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn write(&self, call: String) -> Result<(), ApiError> {
        self.log(call);
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected {
                status: 422,
                message: "validation failed".to_string(),
            });
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ApiError::ServerError {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn to_record(payload: Value) -> RemoteRecord {
        let last_modified = extract_last_modified(&payload, "updated_at");
        RemoteRecord { payload, last_modified }
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn fetch(&self, resource_type: &str, id: &str) -> Result<Option<RemoteRecord>, ApiError> {
        self.log(format!("GET /api/{}/{}", resource_type, id));
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(ApiError::Network("connection reset".to_string()));
        }
        Ok(self.record(resource_type, id).map(Self::to_record))
    }

    async fn create(&self, resource_type: &str, payload: &Value) -> Result<RemoteRecord, ApiError> {
        self.write(format!("POST /api/{}", resource_type)).await?;
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.put_record(resource_type, &id, payload.clone());
        Ok(Self::to_record(payload.clone()))
    }

    async fn update(&self, resource_type: &str, id: &str, payload: &Value) -> Result<RemoteRecord, ApiError> {
        self.write(format!("PUT /api/{}/{}", resource_type, id)).await?;
        self.put_record(resource_type, id, payload.clone());
        Ok(Self::to_record(payload.clone()))
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), ApiError> {
        self.write(format!("DELETE /api/{}/{}", resource_type, id)).await?;
        self.records
            .lock()
            .unwrap()
            .remove(&record_key(resource_type, id));
        Ok(())
    }

    async fn custom_action(&self, action: &str, _payload: &Value) -> Result<Value, ApiError> {
        self.write(format!("POST /api/actions/{}", action)).await?;
        Ok(Value::Null)
    }

    async fn health_check(&self) -> Result<(), ApiError> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        let delay = self.probe_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ApiError::Network("unreachable".to_string()))
        }
    }
}
