//! Wire protocol shared by all instances in the fleet.
//!
//! Every key and channel lives under a `<prefix>requestHandler` namespace so
//! that unrelated deployments can share one Redis as long as their prefixes
//! differ. Payloads are JSON renderings of the value objects in
//! [`crate::request`] and the announcement types below. Pub/sub is
//! best-effort; lost messages are recovered by TTL heartbeats and the
//! periodic reconciliation tick.

use serde::{Deserialize, Serialize};

use crate::client_config::RateLimitSpec;
use crate::request::RequestRecord;

/// Pub/sub channels used by the coordination protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    InstanceStarted,
    InstanceUpdated,
    InstanceHeartbeat,
    InstanceStopped,
    RegenerateClients,
    DestroyClient,
    ClientTokensUpdated,
    RequestAdded,
    RequestHeartbeat,
    RequestReady,
    RequestDone,
    RateLimitUpdated,
}

impl Channel {
    /// All channels an instance subscribes to at startup.
    pub const ALL: [Channel; 12] = [
        Channel::InstanceStarted,
        Channel::InstanceUpdated,
        Channel::InstanceHeartbeat,
        Channel::InstanceStopped,
        Channel::RegenerateClients,
        Channel::DestroyClient,
        Channel::ClientTokensUpdated,
        Channel::RequestAdded,
        Channel::RequestHeartbeat,
        Channel::RequestReady,
        Channel::RequestDone,
        Channel::RateLimitUpdated,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::InstanceStarted => "instanceStarted",
            Channel::InstanceUpdated => "instanceUpdated",
            Channel::InstanceHeartbeat => "instanceHeartbeat",
            Channel::InstanceStopped => "instanceStopped",
            Channel::RegenerateClients => "regenerateClients",
            Channel::DestroyClient => "destroyClient",
            Channel::ClientTokensUpdated => "clientTokensUpdated",
            Channel::RequestAdded => "requestAdded",
            Channel::RequestHeartbeat => "requestHeartbeat",
            Channel::RequestReady => "requestReady",
            Channel::RequestDone => "requestDone",
            Channel::RateLimitUpdated => "rateLimitUpdated",
        }
    }

    pub fn from_name(name: &str) -> Option<Channel> {
        Channel::ALL.iter().copied().find(|c| c.name() == name)
    }
}

/// Key and channel naming under a shared prefix.
#[derive(Debug, Clone)]
pub struct Namespace {
    root: String,
}

impl Namespace {
    pub fn new(prefix: Option<&str>) -> Self {
        let root = match prefix {
            Some(p) if !p.is_empty() => format!("{}requestHandler", p),
            _ => "requestHandler".to_string(),
        };
        Namespace { root }
    }

    pub fn channel(&self, channel: Channel) -> String {
        format!("{}:{}", self.root, channel.name())
    }

    /// Maps a concrete channel name back to its [`Channel`], if it belongs
    /// to this namespace.
    pub fn parse_channel(&self, full_name: &str) -> Option<Channel> {
        let suffix = full_name.strip_prefix(&self.root)?.strip_prefix(':')?;
        Channel::from_name(suffix)
    }

    pub fn all_channels(&self) -> Vec<String> {
        Channel::ALL.iter().map(|c| self.channel(*c)).collect()
    }

    /// Set of live instance ids.
    pub fn instances_key(&self) -> String {
        format!("{}:instances", self.root)
    }

    /// Per-instance registration record, kept alive with a short TTL.
    pub fn instance_key(&self, instance_id: &str) -> String {
        format!("{}:instance:{}", self.root, instance_id)
    }

    /// Encrypted OAuth2 token cache for one client.
    pub fn oauth_key(&self, client_name: &str) -> String {
        format!("{}:{}:oauth2", self.root, client_name)
    }
}

/// Registration payload for `instanceStarted` / `instanceUpdated`, and the
/// JSON body stored under the instance key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAnnouncement {
    pub id: String,
    pub priority: i64,
    pub registered_clients: Vec<String>,
}

/// Payload for `instanceHeartbeat` and `instanceStopped`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSignal {
    pub id: String,
}

/// Payload for `requestAdded`, `requestHeartbeat` and `requestReady`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub record: RequestRecord,
}

/// Payload for `requestDone`. `wait_time_ms > 0` freezes the controller;
/// `is_rate_limited` additionally arms the thaw counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOutcome {
    pub record: RequestRecord,
    pub succeeded: bool,
    pub wait_time_ms: u64,
    pub is_rate_limited: bool,
}

/// Advisory token snapshot for `clientTokensUpdated`. The controller remains
/// authoritative; workers use this only for stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokensUpdate {
    pub client_name: String,
    pub tokens: f64,
}

/// Payload for `rateLimitUpdated`, emitted when a rate-limit-change hook
/// replaced a client's policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitUpdate {
    pub client_name: String,
    pub rate_limit: RateLimitSpec,
}

/// Payload for `regenerateClients`. `client_names: None` reloads every
/// generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateDirective {
    pub client_names: Option<Vec<String>>,
}

/// Payload for `destroyClient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyDirective {
    pub client_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_prefixes_keys_and_channels() {
        let ns = Namespace::new(Some("myapp:"));
        assert_eq!(ns.instances_key(), "myapp:requestHandler:instances");
        assert_eq!(ns.instance_key("i-1"), "myapp:requestHandler:instance:i-1");
        assert_eq!(ns.oauth_key("github"), "myapp:requestHandler:github:oauth2");
        assert_eq!(
            ns.channel(Channel::RequestAdded),
            "myapp:requestHandler:requestAdded"
        );
    }

    #[test]
    fn namespace_defaults_without_prefix() {
        let ns = Namespace::new(None);
        assert_eq!(ns.channel(Channel::InstanceStarted), "requestHandler:instanceStarted");
    }

    #[test]
    fn parse_channel_round_trips_all_channels() {
        let ns = Namespace::new(Some("x"));
        for channel in Channel::ALL {
            let full = ns.channel(channel);
            assert_eq!(ns.parse_channel(&full), Some(channel));
        }
        assert_eq!(ns.parse_channel("other:requestAdded"), None);
    }

    #[test]
    fn announcement_uses_camel_case_fields() {
        let ann = InstanceAnnouncement {
            id: "i-1".to_string(),
            priority: 2,
            registered_clients: vec!["default".to_string()],
        };
        let json = serde_json::to_string(&ann).unwrap();
        assert!(json.contains("registeredClients"));
    }
}
