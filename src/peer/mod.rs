//! Peer registry: who we know, and whether they are alive.
//!
//! The registry owns liveness exclusively. Discovery and heartbeats are
//! the only writers; the lock is never held across I/O. State changes
//! worth reacting to (a peer coming up, a peer evicted) are emitted as
//! `PeerEvent`s for the replication engine.

pub mod discovery;
pub mod heartbeat;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Suspect,
    Dead,
}

#[derive(Clone, Debug)]
pub struct Peer {
    /// Node name, or `host:port` for a static seed whose name is not
    /// yet known.
    pub node_id: String,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub liveness: Liveness,
    pub version: Option<String>,
    pub stats: Option<Value>,
    pub failures: u32,
}

impl Peer {
    fn new(node_id: String, addr: SocketAddr) -> Self {
        Self {
            node_id,
            addr,
            last_seen: Instant::now(),
            liveness: Liveness::Alive,
            version: None,
            stats: None,
            failures: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub enum PeerEvent {
    Up { node_id: String, addr: SocketAddr },
    Down { node_id: String },
}

pub struct PeerRegistry {
    self_id: String,
    inner: Mutex<Inner>,
    events: Sender<PeerEvent>,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<String, Peer>,
    by_addr: HashMap<SocketAddr, String>,
}

impl PeerRegistry {
    pub fn new(self_id: impl Into<String>, events: Sender<PeerEvent>) -> Self {
        Self {
            self_id: self_id.into(),
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Records contact with a peer: insert if unknown, refresh
    /// last_seen and stats, transition to alive. Self is never added.
    pub fn observe(
        &self,
        node_id: &str,
        addr: SocketAddr,
        version: Option<String>,
        stats: Option<Value>,
    ) {
        if node_id == self.self_id || node_id.is_empty() {
            return;
        }
        let event = {
            let mut inner = self.inner.lock().expect("peer registry lock poisoned");
            let is_new = !inner.peers.contains_key(node_id);
            let peer = inner
                .peers
                .entry(node_id.to_string())
                .or_insert_with(|| Peer::new(node_id.to_string(), addr));
            let was_alive = peer.liveness == Liveness::Alive;
            peer.addr = addr;
            peer.last_seen = Instant::now();
            peer.liveness = Liveness::Alive;
            peer.failures = 0;
            if version.is_some() {
                peer.version = version;
            }
            if stats.is_some() {
                peer.stats = stats;
            }
            inner.by_addr.insert(addr, node_id.to_string());
            (is_new || !was_alive).then(|| PeerEvent::Up {
                node_id: node_id.to_string(),
                addr,
            })
        };
        if let Some(event) = event {
            tracing::info!(peer = node_id, %addr, "peer is up");
            let _ = self.events.send(event);
        }
    }

    /// Heartbeat success against a known peer.
    pub fn touch(&self, node_id: &str) {
        let mut inner = self.inner.lock().expect("peer registry lock poisoned");
        if let Some(peer) = inner.peers.get_mut(node_id) {
            peer.last_seen = Instant::now();
            peer.liveness = Liveness::Alive;
            peer.failures = 0;
        }
    }

    /// Re-keys an address-keyed seed once a pong reveals its real node
    /// id, then records the contact like `observe`.
    pub fn promote(&self, addr: SocketAddr, node_id: &str, stats: Option<Value>) {
        if node_id == self.self_id || node_id.is_empty() {
            // A seed that turned out to be ourselves; drop it.
            self.forget_addr(addr);
            return;
        }
        {
            let mut inner = self.inner.lock().expect("peer registry lock poisoned");
            if let Some(old_key) = inner.by_addr.get(&addr).cloned()
                && old_key != node_id
            {
                inner.peers.remove(&old_key);
            }
        }
        self.observe(node_id, addr, None, stats);
    }

    fn forget_addr(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().expect("peer registry lock poisoned");
        if let Some(key) = inner.by_addr.remove(&addr) {
            inner.peers.remove(&key);
        }
    }

    /// Adds a statically configured seed, keyed by its address until
    /// the first pong names it.
    pub fn add_seed(&self, addr: SocketAddr) {
        let placeholder = addr.to_string();
        let known = {
            let inner = self.inner.lock().expect("peer registry lock poisoned");
            inner.by_addr.contains_key(&addr)
        };
        if !known {
            self.observe(&placeholder, addr, None, None);
        }
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        let inner = self.inner.lock().expect("peer registry lock poisoned");
        let mut peers: Vec<Peer> = inner.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    pub fn alive(&self) -> Vec<Peer> {
        self.snapshot()
            .into_iter()
            .filter(|p| p.liveness == Liveness::Alive)
            .collect()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        let inner = self.inner.lock().expect("peer registry lock poisoned");
        inner.peers.contains_key(node_id)
    }

    pub fn addr_of(&self, node_id: &str) -> Option<SocketAddr> {
        let inner = self.inner.lock().expect("peer registry lock poisoned");
        inner.peers.get(node_id).map(|p| p.addr)
    }

    /// Evicts peers not heard from within the timeout. Returns the
    /// removed peers so in-flight work toward them can be cancelled.
    pub fn reap(&self, timeout: Duration) -> Vec<Peer> {
        let removed = {
            let mut inner = self.inner.lock().expect("peer registry lock poisoned");
            let now = Instant::now();
            let stale: Vec<String> = inner
                .peers
                .values()
                .filter(|p| now.duration_since(p.last_seen) > timeout)
                .map(|p| p.node_id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| {
                    let peer = inner.peers.remove(&id)?;
                    inner.by_addr.remove(&peer.addr);
                    Some(peer)
                })
                .collect::<Vec<_>>()
        };
        for peer in &removed {
            tracing::warn!(peer = %peer.node_id, "peer reaped after silence");
            let _ = self.events.send(PeerEvent::Down {
                node_id: peer.node_id.clone(),
            });
        }
        removed
    }

    /// One failed heartbeat. Walks alive -> suspect -> dead; crossing
    /// the threshold evicts the peer and returns true.
    pub fn record_failure(&self, node_id: &str, threshold: u32) -> bool {
        let evicted = {
            let mut inner = self.inner.lock().expect("peer registry lock poisoned");
            let Some(peer) = inner.peers.get_mut(node_id) else {
                return false;
            };
            peer.failures += 1;
            if peer.failures >= threshold.max(1) {
                peer.liveness = Liveness::Dead;
                let peer = inner.peers.remove(node_id);
                if let Some(peer) = &peer {
                    inner.by_addr.remove(&peer.addr);
                }
                true
            } else {
                peer.liveness = Liveness::Suspect;
                false
            }
        };
        if evicted {
            tracing::warn!(peer = node_id, "peer marked dead after repeated failures");
            let _ = self.events.send(PeerEvent::Down {
                node_id: node_id.to_string(),
            });
        }
        evicted
    }

    /// Explicit eviction.
    pub fn mark_dead(&self, node_id: &str) {
        let removed = {
            let mut inner = self.inner.lock().expect("peer registry lock poisoned");
            let peer = inner.peers.remove(node_id);
            if let Some(peer) = &peer {
                inner.by_addr.remove(&peer.addr);
            }
            peer.is_some()
        };
        if removed {
            let _ = self.events.send(PeerEvent::Down {
                node_id: node_id.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{unbounded, Receiver};

    fn registry() -> (PeerRegistry, Receiver<PeerEvent>) {
        let (tx, rx) = unbounded();
        (PeerRegistry::new("node-a", tx), rx)
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn observe_inserts_and_emits_up_once() {
        let (reg, rx) = registry();
        reg.observe("node-b", addr(9000), None, None);
        reg.observe("node-b", addr(9000), None, None);
        assert_eq!(reg.alive().len(), 1);
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Up { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn self_is_never_registered() {
        let (reg, rx) = registry();
        reg.observe("node-a", addr(9000), None, None);
        assert!(reg.snapshot().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reap_evicts_silent_peers() {
        let (reg, rx) = registry();
        reg.observe("node-b", addr(9000), None, None);
        let _ = rx.try_recv();

        assert!(reg.reap(Duration::from_secs(60)).is_empty());
        let removed = reg.reap(Duration::ZERO);
        assert_eq!(removed.len(), 1);
        assert!(reg.snapshot().is_empty());
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Down { .. }));
    }

    #[test]
    fn failures_walk_toward_eviction() {
        let (reg, rx) = registry();
        reg.observe("node-b", addr(9000), None, None);
        let _ = rx.try_recv();

        assert!(!reg.record_failure("node-b", 3));
        assert_eq!(reg.snapshot()[0].liveness, Liveness::Suspect);
        assert!(reg.alive().is_empty());
        assert!(!reg.record_failure("node-b", 3));
        assert!(reg.record_failure("node-b", 3));
        assert!(reg.snapshot().is_empty());
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Down { .. }));

        // Contact after eviction brings the peer back up.
        reg.observe("node-b", addr(9000), None, None);
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Up { .. }));
    }

    #[test]
    fn mark_dead_evicts_immediately() {
        let (reg, rx) = registry();
        reg.observe("node-b", addr(9000), None, None);
        let _ = rx.try_recv();

        reg.mark_dead("node-b");
        assert!(reg.snapshot().is_empty());
        assert_eq!(reg.addr_of("node-b"), None);
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Down { .. }));

        // Unknown ids are a no-op.
        reg.mark_dead("node-c");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn seed_promotion_rekeys_by_name() {
        let (reg, rx) = registry();
        reg.add_seed(addr(9000));
        let seeded = reg.snapshot();
        assert_eq!(seeded[0].node_id, "127.0.0.1:9000");
        let _ = rx.try_recv();

        reg.promote(addr(9000), "node-b", None);
        let peers = reg.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node_id, "node-b");
        assert_eq!(reg.addr_of("node-b"), Some(addr(9000)));
    }

    #[test]
    fn seed_that_is_self_gets_dropped() {
        let (reg, _rx) = registry();
        reg.add_seed(addr(9000));
        reg.promote(addr(9000), "node-a", None);
        assert!(reg.snapshot().is_empty());
    }
}
