//! Session registry: the live peer table. Sole owner of PeerRecords; derives peer
//! status from discovery observations and elapsed time.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::LivenessWindows;
use crate::event::Event;
use crate::identity::Identity;
use crate::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PeerStatus {
    Online,
    Away,
    Offline,
}

/// One discovered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    pub identity: Identity,
    pub status: PeerStatus,
    pub last_seen: Millis,
    pub first_seen: Millis,
}

impl PeerRecord {
    pub fn address(&self) -> SocketAddr {
        self.identity.address
    }
}

/// Live peer table keyed by peer address.
#[derive(Debug)]
pub struct SessionRegistry {
    windows: LivenessWindows,
    peers: HashMap<SocketAddr, PeerRecord>,
}

impl SessionRegistry {
    pub fn new(windows: LivenessWindows) -> Self {
        Self {
            windows,
            peers: HashMap::new(),
        }
    }

    /// Record an announcement. New peers emit PeerJoined; known peers emit PeerUpdated
    /// when their status or identity changed.
    pub fn observe(&mut self, identity: Identity, observed_at: Millis) -> Vec<Event> {
        let address = identity.address;
        let Some(record) = self.peers.get_mut(&address) else {
            let record = PeerRecord {
                identity,
                status: PeerStatus::Online,
                last_seen: observed_at,
                first_seen: observed_at,
            };
            info!(
                peer = %address,
                name = %record.identity.display_name,
                device = %record.identity.device_label,
                "Peer joined"
            );
            self.peers.insert(address, record.clone());
            return vec![Event::PeerJoined(record)];
        };

        record.last_seen = record.last_seen.max(observed_at);
        let mut changed = false;
        if record.identity != identity {
            record.identity = identity;
            changed = true;
        }
        let status = self.windows.status_at(record.last_seen, observed_at);
        if status != record.status {
            debug!(peer = %address, from = ?record.status, to = ?status, "Peer status changed");
            record.status = status;
            changed = true;
        }
        if changed {
            vec![Event::PeerUpdated(record.clone())]
        } else {
            vec![]
        }
    }

    /// Recompute every status and evict expired records. When one tick crosses several
    /// thresholds every intermediate status is reported, in order.
    pub fn tick(&mut self, now: Millis) -> Vec<Event> {
        let mut events = Vec::new();
        let mut evicted = Vec::new();

        let mut addresses: Vec<SocketAddr> = self.peers.keys().copied().collect();
        addresses.sort_by_key(|a| self.peers[a].first_seen);

        for address in addresses {
            let Some(record) = self.peers.get_mut(&address) else {
                continue;
            };
            let elapsed = now.saturating_sub(record.last_seen);
            let target = self.windows.status_at(record.last_seen, now);
            while record.status != target && rank(record.status) < rank(target) {
                record.status = next_status(record.status);
                debug!(peer = %address, status = ?record.status, "Peer status changed");
                events.push(Event::PeerUpdated(record.clone()));
            }
            if elapsed > self.windows.eviction {
                evicted.push(address);
            }
        }

        for address in evicted {
            if let Some(record) = self.peers.remove(&address) {
                info!(peer = %address, name = %record.identity.display_name, "Peer evicted");
                events.push(Event::PeerLeft(record));
            }
        }
        events
    }

    /// Snapshot ordered by first_seen ascending, excluding `exclude`.
    pub fn list_peers(&self, exclude: SocketAddr) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self
            .peers
            .values()
            .filter(|r| r.identity.address != exclude)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.identity.address.cmp(&b.identity.address))
        });
        out
    }

    pub fn status_of(&self, address: &SocketAddr) -> Option<PeerStatus> {
        self.peers.get(address).map(|r| r.status)
    }

    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.peers.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl LivenessWindows {
    /// Status of a peer last seen at `last_seen`, evaluated at `now`.
    pub fn status_at(&self, last_seen: Millis, now: Millis) -> PeerStatus {
        let elapsed = now.saturating_sub(last_seen);
        if elapsed <= self.online {
            PeerStatus::Online
        } else if elapsed <= self.away {
            PeerStatus::Away
        } else {
            PeerStatus::Offline
        }
    }
}

fn rank(status: PeerStatus) -> u8 {
    match status {
        PeerStatus::Online => 0,
        PeerStatus::Away => 1,
        PeerStatus::Offline => 2,
    }
}

fn next_status(status: PeerStatus) -> PeerStatus {
    match status {
        PeerStatus::Online => PeerStatus::Away,
        PeerStatus::Away | PeerStatus::Offline => PeerStatus::Offline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, addr: &str) -> Identity {
        Identity {
            display_name: name.into(),
            device_label: "Laptop".into(),
            address: addr.parse().unwrap(),
            platform_tag: "linux-x86_64".into(),
            session_start: 0,
        }
    }

    fn me() -> SocketAddr {
        "192.168.1.10:45681".parse().unwrap()
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(LivenessWindows::default())
    }

    /// Statuses reported by PeerUpdated events, plus "left" for PeerLeft.
    fn trail(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                Event::PeerJoined(_) => "joined".to_string(),
                Event::PeerUpdated(r) => format!("{:?}", r.status),
                Event::PeerLeft(_) => "left".to_string(),
                other => panic!("unexpected event {other:?}"),
            })
            .collect()
    }

    #[test]
    fn first_observation_joins() {
        let mut reg = registry();
        let events = reg.observe(identity("Bob", "192.168.1.11:45681"), 1_000);
        assert_eq!(trail(&events), vec!["joined"]);
        assert_eq!(reg.status_of(&"192.168.1.11:45681".parse().unwrap()), Some(PeerStatus::Online));
    }

    #[test]
    fn repeat_observation_is_quiet() {
        let mut reg = registry();
        reg.observe(identity("Bob", "192.168.1.11:45681"), 1_000);
        assert!(reg.observe(identity("Bob", "192.168.1.11:45681"), 6_000).is_empty());
        let peers = reg.list_peers(me());
        assert_eq!(peers[0].last_seen, 6_000);
        assert_eq!(peers[0].first_seen, 1_000);
    }

    #[test]
    fn changed_identity_updates() {
        let mut reg = registry();
        reg.observe(identity("Bob", "192.168.1.11:45681"), 1_000);
        let events = reg.observe(identity("Robert", "192.168.1.11:45681"), 2_000);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::PeerUpdated(r) => assert_eq!(r.identity.display_name, "Robert"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn silent_peer_walks_every_state_then_leaves() {
        let mut reg = registry();
        let w = LivenessWindows::default();
        let mut events = reg.observe(identity("Bob", "192.168.1.11:45681"), 0);
        let mut now = 0;
        while now <= w.eviction + 2_000 {
            now += 1_000;
            events.extend(reg.tick(now));
        }
        assert_eq!(trail(&events), vec!["joined", "Away", "Offline", "left"]);
        assert!(reg.is_empty());
    }

    #[test]
    fn coarse_tick_still_reports_each_state() {
        let mut reg = registry();
        reg.observe(identity("Bob", "192.168.1.11:45681"), 0);
        let events = reg.tick(1_000_000);
        assert_eq!(trail(&events), vec!["Away", "Offline", "left"]);
    }

    #[test]
    fn thresholds_are_respected() {
        let mut reg = registry();
        let addr: SocketAddr = "192.168.1.11:45681".parse().unwrap();
        reg.observe(identity("Bob", "192.168.1.11:45681"), 0);
        reg.tick(10_000);
        assert_eq!(reg.status_of(&addr), Some(PeerStatus::Online));
        reg.tick(10_001);
        assert_eq!(reg.status_of(&addr), Some(PeerStatus::Away));
        reg.tick(30_001);
        assert_eq!(reg.status_of(&addr), Some(PeerStatus::Offline));
        reg.tick(100_000);
        assert!(reg.contains(&addr));
        reg.tick(100_001);
        assert!(!reg.contains(&addr));
    }

    #[test]
    fn returning_peer_goes_back_online() {
        let mut reg = registry();
        reg.observe(identity("Bob", "192.168.1.11:45681"), 0);
        reg.tick(40_000);
        let events = reg.observe(identity("Bob", "192.168.1.11:45681"), 41_000);
        match &events[..] {
            [Event::PeerUpdated(r)] => assert_eq!(r.status, PeerStatus::Online),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn list_orders_by_first_seen_and_excludes_self() {
        let mut reg = registry();
        reg.observe(identity("Carol", "192.168.1.13:45681"), 3_000);
        reg.observe(identity("Alice", "192.168.1.10:45681"), 1_000);
        reg.observe(identity("Bob", "192.168.1.11:45681"), 2_000);
        let names: Vec<_> = reg
            .list_peers(me())
            .into_iter()
            .map(|r| r.identity.display_name)
            .collect();
        assert_eq!(names, vec!["Bob", "Carol"]);
    }

    #[test]
    fn nobody_announces_means_empty_list() {
        let mut reg = registry();
        for t in (0..=120_000).step_by(1_000) {
            assert!(reg.tick(t).is_empty());
        }
        assert!(reg.list_peers(me()).is_empty());
    }
}
