//! Client ownership across the fleet.
//!
//! Every instance keeps an in-memory table of its peers, fed by the
//! `instanceStarted` / `instanceUpdated` announcements and kept alive by
//! `instanceHeartbeat`. The controller for a client is a pure function of
//! that table: order instances by priority descending, break ties by the
//! lexicographically greater id, and pick the first one registering the
//! client. Both sides of a tie compute the same winner, so no coordination
//! beyond the announcements is needed.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::InstanceAnnouncement;

/// One known instance, as last announced.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub priority: i64,
    pub registered_clients: BTreeSet<String>,
    pub last_seen: Instant,
}

impl Peer {
    fn from_announcement(announcement: InstanceAnnouncement) -> Self {
        Self {
            id: announcement.id,
            priority: announcement.priority,
            registered_clients: announcement.registered_clients.into_iter().collect(),
            last_seen: Instant::now(),
        }
    }
}

/// Ordering used everywhere an instance ranking is needed: priority
/// descending, then the lexicographically greater id first.
pub fn compare_peers(a: &Peer, b: &Peer) -> Ordering {
    b.priority.cmp(&a.priority).then_with(|| b.id.cmp(&a.id))
}

/// In-memory table of known instances, self included.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a peer from an announcement, refreshing its
    /// heartbeat.
    pub fn upsert(&mut self, announcement: InstanceAnnouncement) {
        let peer = Peer::from_announcement(announcement);
        self.peers.insert(peer.id.clone(), peer);
    }

    /// Refreshes a peer's heartbeat. Returns false for unknown ids so the
    /// caller can fetch the peer's registration as a catch-up.
    pub fn heartbeat(&mut self, id: &str) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.peers.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Drops peers whose heartbeat is older than `max_age`, returning the
    /// removed ids.
    pub fn prune_stale(&mut self, max_age: Duration, keep: &str) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|peer| peer.id != keep && now.duration_since(peer.last_seen) > max_age)
            .map(|peer| peer.id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    /// The controller for `client_name`: the highest-ordered instance that
    /// registers it.
    pub fn controller_for(&self, client_name: &str) -> Option<&str> {
        self.peers
            .values()
            .filter(|peer| peer.registered_clients.contains(client_name))
            .min_by(|a, b| compare_peers(a, b))
            .map(|peer| peer.id.as_str())
    }

    /// True when `instance_id` is the controller for `client_name`.
    pub fn is_controller(&self, instance_id: &str, client_name: &str) -> bool {
        self.controller_for(client_name) == Some(instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(id: &str, priority: i64, clients: &[&str]) -> InstanceAnnouncement {
        InstanceAnnouncement {
            id: id.to_string(),
            priority,
            registered_clients: clients.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn higher_priority_instance_wins() {
        let mut table = PeerTable::new();
        table.upsert(announce("i-low", 1, &["api"]));
        table.upsert(announce("i-high", 2, &["api"]));

        assert_eq!(table.controller_for("api"), Some("i-high"));
        assert!(table.is_controller("i-high", "api"));
        assert!(!table.is_controller("i-low", "api"));
    }

    #[test]
    fn equal_priority_ties_break_on_greater_id() {
        let mut table = PeerTable::new();
        table.upsert(announce("aaa", 1, &["api"]));
        table.upsert(announce("zzz", 1, &["api"]));

        assert_eq!(table.controller_for("api"), Some("zzz"));
    }

    #[test]
    fn controller_must_register_the_client() {
        let mut table = PeerTable::new();
        table.upsert(announce("i-high", 9, &["other"]));
        table.upsert(announce("i-low", 1, &["api"]));

        assert_eq!(table.controller_for("api"), Some("i-low"));
        assert_eq!(table.controller_for("missing"), None);
    }

    #[test]
    fn updates_replace_registration() {
        let mut table = PeerTable::new();
        table.upsert(announce("i-1", 5, &["api"]));
        table.upsert(announce("i-2", 1, &["api"]));
        assert_eq!(table.controller_for("api"), Some("i-1"));

        // i-1 dropped the client in a later announcement.
        table.upsert(announce("i-1", 5, &[]));
        assert_eq!(table.controller_for("api"), Some("i-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_peers_are_pruned_but_self_is_kept() {
        let mut table = PeerTable::new();
        table.upsert(announce("self", 1, &["api"]));
        table.upsert(announce("peer", 2, &["api"]));

        tokio::time::advance(Duration::from_secs(2)).await;
        table.heartbeat("peer");
        tokio::time::advance(Duration::from_secs(2)).await;

        // "peer" heart-beated 2s ago, still fresh under a 3s window.
        assert!(table.prune_stale(Duration::from_secs(3), "self").is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let removed = table.prune_stale(Duration::from_secs(3), "self");
        assert_eq!(removed, vec!["peer".to_string()]);
        assert!(table.contains("self"));
        assert_eq!(table.controller_for("api"), Some("self"));
    }

    #[test]
    fn heartbeat_for_unknown_peer_reports_miss() {
        let mut table = PeerTable::new();
        assert!(!table.heartbeat("ghost"));
    }
}
