//! In-process transport for tests and examples.
//!
//! A [`MemoryHub`] stands in for one Redis deployment: every
//! [`MemoryTransport`] cloned from it shares the same keyspace and pub/sub
//! fan-out, so several `Dispatcher` instances can form a fleet inside a
//! single test process. Expiry honors `tokio::time`, which makes TTL
//! behavior drivable with paused test time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::DispatcherResult;
use crate::transport::{PubSubMessage, Transport};

#[derive(Default)]
struct HubState {
    subscribers: Vec<Subscriber>,
    strings: HashMap<String, ExpiringValue>,
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

struct Subscriber {
    channels: HashSet<String>,
    sender: mpsc::UnboundedSender<PubSubMessage>,
}

struct ExpiringValue {
    value: String,
    expires_at: Option<Instant>,
}

impl ExpiringValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Shared in-memory store backing a fleet of [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport connected to this hub.
    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            state: Arc::clone(&self.state),
        })
    }

    /// Drops expired string keys, mirroring Redis TTL eviction. Tests using
    /// paused time can call this after advancing the clock.
    pub fn evict_expired(&self) {
        let mut state = self.state.lock().unwrap();
        state.strings.retain(|_, entry| !entry.is_expired());
    }
}

/// [`Transport`] implementation over a [`MemoryHub`].
pub struct MemoryTransport {
    state: Arc<Mutex<HubState>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, channel: &str, payload: &str) -> DispatcherResult<()> {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|sub| !sub.sender.is_closed());
        for sub in &state.subscribers {
            if sub.channels.contains(channel) {
                let _ = sub.sender.send(PubSubMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: Vec<String>,
    ) -> DispatcherResult<mpsc::UnboundedReceiver<PubSubMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.subscribers.push(Subscriber {
            channels: channels.into_iter().collect(),
            sender: tx,
        });
        Ok(rx)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> DispatcherResult<()> {
        let mut state = self.state.lock().unwrap();
        state.strings.insert(
            key.to_string(),
            ExpiringValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> DispatcherResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> DispatcherResult<Option<String>> {
        let mut state = self.state.lock().unwrap();
        match state.strings.get(key) {
            Some(entry) if entry.is_expired() => {
                state.strings.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> DispatcherResult<()> {
        let mut state = self.state.lock().unwrap();
        state.strings.remove(key);
        state.sets.remove(key);
        state.hashes.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> DispatcherResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> DispatcherResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> DispatcherResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> DispatcherResult<()> {
        let mut state = self.state.lock().unwrap();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> DispatcherResult<HashMap<String, String>> {
        let state = self.state.lock().unwrap();
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_matching_subscribers_only() {
        let hub = MemoryHub::new();
        let transport = hub.transport();

        let mut matching = transport.subscribe(vec!["a".to_string()]).await.unwrap();
        let mut other = transport.subscribe(vec!["b".to_string()]).await.unwrap();

        transport.publish("a", "hello").await.unwrap();

        let message = matching.recv().await.unwrap();
        assert_eq!(message.channel, "a");
        assert_eq!(message.payload, "hello");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn transports_from_one_hub_share_state() {
        let hub = MemoryHub::new();
        let first = hub.transport();
        let second = hub.transport();

        first.set_add("members", "x").await.unwrap();
        assert_eq!(second.set_members("members").await.unwrap(), vec!["x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_with_virtual_time() {
        let hub = MemoryHub::new();
        let transport = hub.transport();

        transport
            .set_with_expiry("k", "v", Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(transport.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(transport.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_fields_accumulate() {
        let hub = MemoryHub::new();
        let transport = hub.transport();

        transport
            .hash_set("h", &[("a".to_string(), "1".to_string())])
            .await
            .unwrap();
        transport
            .hash_set("h", &[("b".to_string(), "2".to_string())])
            .await
            .unwrap();

        let all = transport.hash_get_all("h").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"], "1");
        assert_eq!(all["b"], "2");
    }
}
