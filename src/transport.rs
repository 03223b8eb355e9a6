//! Storage and pub/sub seam between the coordinator and Redis.
//!
//! The coordination core only needs a small slice of Redis: fire-and-forget
//! pub/sub, a handful of keyed values with TTLs, one set, and one hash per
//! client for the OAuth2 token cache. Putting that slice behind a trait keeps
//! the election and admission logic exercisable in-process (see
//! [`crate::testing::MemoryTransport`]) while production uses
//! [`crate::redis::RedisTransport`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DispatcherResult;

/// One message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Minimal key/value + pub/sub surface required by the coordinator.
///
/// Implementations are best-effort for pub/sub: messages may be dropped, and
/// callers are expected to recover through heartbeats and reconciliation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> DispatcherResult<()>;

    /// Subscribes to the given channels. Messages arrive on the returned
    /// receiver until the transport is dropped or the receiver is closed.
    async fn subscribe(
        &self,
        channels: Vec<String>,
    ) -> DispatcherResult<mpsc::UnboundedReceiver<PubSubMessage>>;

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> DispatcherResult<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> DispatcherResult<()>;

    async fn get(&self, key: &str) -> DispatcherResult<Option<String>>;

    async fn delete(&self, key: &str) -> DispatcherResult<()>;

    async fn set_add(&self, key: &str, member: &str) -> DispatcherResult<()>;

    async fn set_remove(&self, key: &str, member: &str) -> DispatcherResult<()>;

    async fn set_members(&self, key: &str) -> DispatcherResult<Vec<String>>;

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> DispatcherResult<()>;

    async fn hash_get_all(&self, key: &str) -> DispatcherResult<HashMap<String, String>>;
}
