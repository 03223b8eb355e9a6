use serde::Serialize;

use crate::request::RequestRecord;

/// Point-in-time view of one client, answered from the local instance's
/// view (controllers are authoritative, workers answer from their mirror).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub client_name: String,
    pub is_frozen: bool,
    pub is_thawing: bool,
    pub thaw_request_count: u32,
    pub rate_limit: RateLimitSnapshot,
    pub requests_in_queue: RequestBucketStats,
    pub requests_in_progress: RequestBucketStats,
}

/// Count and summed cost of one status bucket, with the records themselves
/// for debugging.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBucketStats {
    pub count: usize,
    pub cost: u64,
    pub requests: Vec<RequestRecord>,
}

impl RequestBucketStats {
    pub fn from_records(records: Vec<RequestRecord>) -> Self {
        Self {
            count: records.len(),
            cost: records.iter().map(|r| r.cost).sum(),
            requests: records,
        }
    }
}

/// Current rate-limit state, including live counters.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RateLimitSnapshot {
    NoLimit,
    #[serde(rename_all = "camelCase")]
    RequestLimit {
        interval: u64,
        tokens_to_add: f64,
        max_tokens: f64,
        tokens: f64,
    },
    #[serde(rename_all = "camelCase")]
    ConcurrencyLimit {
        max_concurrency: u64,
        in_flight_cost: u64,
    },
    #[serde(rename_all = "camelCase")]
    SharedLimit { client_name: String },
}
