//! Remote API - HTTP communication with the authoritative server
//!
//! Routes (per resource type):
//! - `GET    /api/{type}/{id}`   fetch (404 = absent)
//! - `POST   /api/{type}`        create
//! - `PUT    /api/{type}/{id}`   update
//! - `DELETE /api/{type}/{id}`   delete (404 = already gone)
//! - `POST   /api/actions/{action}` custom action
//! - `GET    /api/health`        reachability probe

use crate::config::EngineConfig;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Server copy of an entity
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub payload: Value,

    /// Parsed last-modified marker, if the payload carries one
    pub last_modified: Option<DateTime<Utc>>,
}

/// Remote write and read operations the engine needs
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Current server copy, `None` when the server reports not-found
    async fn fetch(&self, resource_type: &str, id: &str) -> Result<Option<RemoteRecord>, ApiError>;

    async fn create(&self, resource_type: &str, payload: &Value) -> Result<RemoteRecord, ApiError>;

    async fn update(&self, resource_type: &str, id: &str, payload: &Value) -> Result<RemoteRecord, ApiError>;

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), ApiError>;

    async fn custom_action(&self, action: &str, payload: &Value) -> Result<Value, ApiError>;

    /// Lightweight reachability check
    async fn health_check(&self) -> Result<(), ApiError>;
}

pub type SharedApi = Arc<dyn RemoteApi>;

/// Read the last-modified marker from a payload field.
///
/// Accepts RFC 3339 strings or epoch milliseconds.
pub fn extract_last_modified(payload: &Value, field: &str) -> Option<DateTime<Utc>> {
    match payload.get(field)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

// ============================================================================
// HTTP Client
// ============================================================================

/// reqwest-backed [`RemoteApi`]
pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    client_id: String,
    last_modified_field: String,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpRemoteApi {
    pub fn new(config: &EngineConfig) -> Result<Self, ApiError> {
        let parsed = url::Url::parse(&config.api_base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", config.api_base_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(config.api_base_url.clone()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            last_modified_field: config.last_modified_field.clone(),
            access_token: Arc::new(RwLock::new(config.api_token.clone())),
        })
    }

    /// Set access token
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    /// Get current token
    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    /// `{base}/api/{segment}/{segment}...` with each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> String {
        let mut url = format!("{}/api", self.base_url);
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("X-Client-Id", &self.client_id);
        match self.get_token().await {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        self.authorized(request)
            .await
            .send()
            .await
            .map_err(request_error)
    }

    fn to_record(&self, payload: Value) -> RemoteRecord {
        let last_modified = extract_last_modified(&payload, &self.last_modified_field);
        RemoteRecord { payload, last_modified }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn fetch(&self, resource_type: &str, id: &str) -> Result<Option<RemoteRecord>, ApiError> {
        let response = self
            .send(self.client.get(self.endpoint(&[resource_type, id])))
            .await?;

        // Absent on the server: the coordinator creates it
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let payload = handle_response(response).await?;
        Ok(Some(self.to_record(payload)))
    }

    async fn create(&self, resource_type: &str, payload: &Value) -> Result<RemoteRecord, ApiError> {
        let response = self
            .send(self.client.post(self.endpoint(&[resource_type])).json(payload))
            .await?;

        let body = handle_response(response).await?;
        Ok(self.to_record(echo_if_empty(body, payload)))
    }

    async fn update(&self, resource_type: &str, id: &str, payload: &Value) -> Result<RemoteRecord, ApiError> {
        let response = self
            .send(self.client.put(self.endpoint(&[resource_type, id])).json(payload))
            .await?;

        let body = handle_response(response).await?;
        Ok(self.to_record(echo_if_empty(body, payload)))
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), ApiError> {
        let response = self
            .send(self.client.delete(self.endpoint(&[resource_type, id])))
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }

    async fn custom_action(&self, action: &str, payload: &Value) -> Result<Value, ApiError> {
        let response = self
            .send(self.client.post(self.endpoint(&["actions", action])).json(payload))
            .await?;

        handle_response(response).await
    }

    async fn health_check(&self) -> Result<(), ApiError> {
        let response = self.send(self.client.get(self.endpoint(&["health"]))).await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }
}

/// Writes answered with an empty body keep the payload that was sent
fn echo_if_empty(body: Value, sent: &Value) -> Value {
    if body.is_null() {
        sent.clone()
    } else {
        body
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Unauthorized - token rejected")]
    Unauthorized,

    #[error("Resource not found")]
    NotFound,

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Invalid API base URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ApiError {
    /// Network failures, timeouts, 5xx and 429 may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Request(_)
                | ApiError::Timeout
                | ApiError::RateLimitExceeded
                | ApiError::ServerError { .. }
                | ApiError::Network(_)
        )
    }
}

fn request_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else if e.is_connect() {
        ApiError::Network(e.to_string())
    } else {
        ApiError::Request(e)
    }
}

/// Handle successful JSON response (empty body reads as `null`)
async fn handle_response(response: reqwest::Response) -> Result<Value, ApiError> {
    if !response.status().is_success() {
        return Err(handle_error(response).await);
    }

    let text = response.text().await.map_err(request_error)?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|_| ApiError::InvalidResponse)
}

/// Convert error response to ApiError
async fn handle_error(response: reqwest::Response) -> ApiError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::NOT_FOUND => ApiError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimitExceeded,
        s if s.is_server_error() => {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            ApiError::ServerError { status: s.as_u16(), message }
        }
        s => {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            ApiError::Rejected { status: s.as_u16(), message }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
