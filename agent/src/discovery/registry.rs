use chrono::{DateTime, Duration, Utc};
use common::Peer;
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Refreshed,
}

/// Known peers per looked-up service, keyed by their advertised address.
///
/// A service never maps to an empty peer set; the entry is dropped together
/// with its last peer.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: HashMap<String, HashMap<SocketAddr, Peer>>,
    max_life: Duration,
}

impl PeerRegistry {
    pub fn new(max_life: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            max_life,
        }
    }

    pub fn contains(&self, service: &str, address: SocketAddr) -> bool {
        self.peers
            .get(service)
            .is_some_and(|set| set.contains_key(&address))
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.peers.contains_key(service)
    }

    /// Inserts a new peer or refreshes a known one. A refresh never moves
    /// `last_seen` backwards, so a late duplicate cannot shorten a peer's life.
    pub fn upsert(&mut self, service: &str, address: SocketAddr, seen: DateTime<Utc>) -> Upsert {
        let set = self.peers.entry(service.to_string()).or_default();
        match set.get_mut(&address) {
            Some(peer) => {
                if seen > peer.last_seen {
                    peer.last_seen = seen;
                }
                Upsert::Refreshed
            }
            None => {
                set.insert(
                    address,
                    Peer {
                        service: service.to_string(),
                        address,
                        last_seen: seen,
                    },
                );
                Upsert::Added
            }
        }
    }

    pub fn remove(&mut self, service: &str, address: SocketAddr) -> Option<Peer> {
        let set = self.peers.get_mut(service)?;
        let removed = set.remove(&address);
        if set.is_empty() {
            self.peers.remove(service);
        }
        removed
    }

    /// Evicts every peer silent for longer than the max life and returns
    /// exactly the evicted peers.
    ///
    /// Ages are wall-clock differences, so a clock step moves every deadline:
    /// stepping back keeps peers longer, stepping forward can expire them
    /// all in one sweep.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Peer> {
        let max_life = self.max_life;
        let mut expired = Vec::new();

        self.peers.retain(|_, set| {
            set.retain(|_, peer| {
                if now.signed_duration_since(peer.last_seen) > max_life {
                    expired.push(peer.clone());
                    false
                } else {
                    true
                }
            });
            !set.is_empty()
        });

        expired
    }

    pub fn peers(&self, service: &str) -> Vec<Peer> {
        self.peers
            .get(service)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn services(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Duration::seconds(60))
    }

    #[test]
    fn first_upsert_adds_then_refreshes() {
        let mut registry = registry();
        let printer = addr("10.0.0.5:9000");

        assert_eq!(registry.upsert("printer", printer, at(0)), Upsert::Added);
        assert_eq!(registry.upsert("printer", printer, at(3)), Upsert::Refreshed);
        assert!(registry.contains("printer", printer));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn refresh_keeps_the_latest_timestamp() {
        let mut registry = registry();
        let printer = addr("10.0.0.5:9000");

        for secs in [5, 2, 9, 7, 9, 1] {
            registry.upsert("printer", printer, at(secs));
        }

        let peers = registry.peers("printer");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].last_seen, at(9));
    }

    #[test]
    fn same_address_under_different_services_is_distinct() {
        let mut registry = registry();
        let host = addr("10.0.0.5:9000");

        registry.upsert("printer", host, at(0));
        assert_eq!(registry.upsert("scanner", host, at(0)), Upsert::Added);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_drops_empty_service_entries() {
        let mut registry = registry();
        let a = addr("10.0.0.5:9000");
        let b = addr("10.0.0.6:9000");
        registry.upsert("printer", a, at(0));
        registry.upsert("printer", b, at(0));

        assert_eq!(registry.remove("printer", a).map(|p| p.address), Some(a));
        assert!(registry.has_service("printer"));

        assert!(registry.remove("printer", b).is_some());
        assert!(!registry.has_service("printer"));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_of_unknown_peer_is_a_noop() {
        let mut registry = registry();
        registry.upsert("printer", addr("10.0.0.5:9000"), at(0));

        assert!(registry.remove("printer", addr("10.0.0.9:9000")).is_none());
        assert!(registry.remove("scanner", addr("10.0.0.5:9000")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sweep_expires_only_after_max_life() {
        let mut registry = registry();
        let printer = addr("10.0.0.5:9000");
        registry.upsert("printer", printer, at(0));

        assert!(registry.sweep(at(60)).is_empty());
        assert!(registry.contains("printer", printer));

        let expired = registry.sweep(at(61));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].address, printer);
        assert!(!registry.has_service("printer"));

        assert!(registry.sweep(at(62)).is_empty());
    }

    #[test]
    fn sweep_returns_exactly_the_expired_set() {
        let mut registry = registry();
        registry.upsert("printer", addr("10.0.0.5:9000"), at(0));
        registry.upsert("printer", addr("10.0.0.6:9000"), at(30));
        registry.upsert("scanner", addr("10.0.0.7:7000"), at(0));

        let mut expired: Vec<String> = registry
            .sweep(at(70))
            .into_iter()
            .map(|p| p.to_string())
            .collect();
        expired.sort();

        assert_eq!(expired, vec!["printer@10.0.0.5:9000", "scanner@10.0.0.7:7000"]);
        assert_eq!(registry.services(), vec!["printer".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clock_stepping_back_keeps_peers() {
        let mut registry = registry();
        registry.upsert("printer", addr("10.0.0.5:9000"), at(100));

        assert!(registry.sweep(at(0)).is_empty());
        assert!(registry.contains("printer", addr("10.0.0.5:9000")));

        let expired = registry.sweep(at(161));
        assert_eq!(expired.len(), 1);
        assert!(registry.is_empty());
    }
}
