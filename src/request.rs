//! Request value objects and the admission ordering they obey.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestStatus {
    InQueue,
    InProgress,
}

/// One outbound call as tracked by the coordination protocol.
///
/// Created by the originating instance, mirrored on every instance that
/// registers the client, and destroyed when `requestDone` is observed or the
/// record's heartbeat lapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub request_id: String,
    pub client_name: String,
    pub status: RequestStatus,
    pub priority: i64,
    pub cost: u64,
    /// Milliseconds since epoch at enqueue time.
    pub timestamp: u64,
    pub retries: u32,
}

impl RequestRecord {
    pub fn new(client_name: String, priority: i64, cost: u64) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            client_name,
            status: RequestStatus::InQueue,
            priority,
            cost,
            timestamp: now_millis(),
            retries: 0,
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Admission order used by the controller's next-request selector.
///
/// Queued records come first; among those, higher priority wins, then more
/// retries (so retrying requests drain before new ones), then the earlier
/// timestamp, then the lexicographically smaller request id as the final
/// deterministic tiebreak. Records already in progress sort to the end.
pub fn admission_order(a: &RequestRecord, b: &RequestRecord) -> Ordering {
    let a_in_progress = a.status == RequestStatus::InProgress;
    let b_in_progress = b.status == RequestStatus::InProgress;
    a_in_progress
        .cmp(&b_in_progress)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| b.retries.cmp(&a.retries))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.request_id.cmp(&b.request_id))
}

/// Caller-supplied description of one outbound call.
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    /// Name of the client that governs this call. `"default"` always exists.
    pub client_name: String,
    /// HTTP method, defaults to GET.
    pub method: Option<String>,
    /// Absolute URL, or a path resolved against the effective base URL.
    pub url: String,
    pub base_url: Option<String>,
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, String>,
    /// JSON request body.
    pub body: Option<serde_json::Value>,
    /// Admission priority, higher wins. Defaults to 1.
    pub priority: Option<i64>,
    /// Weight in rate-limit units. Defaults to 1.
    pub cost: Option<u64>,
    pub metadata: Option<serde_json::Value>,
}

impl RequestConfig {
    pub fn get(client_name: &str, url: &str) -> Self {
        Self {
            client_name: client_name.to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }
}

/// Materialized upstream response handed back to the caller and to
/// response interceptors.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}
