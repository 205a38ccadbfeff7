//! LAN discovery: periodic UDP broadcast announcements and a listener.
//!
//! Datagrams are raw JSON messages (no length prefix). Self-origin
//! datagrams are ignored; everything else that validates feeds the peer
//! registry.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::peer::PeerRegistry;
use crate::proto::message::{DiscoveryPayload, Kind, Message};

pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
const LISTEN_POLL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub node_id: String,
    pub tcp_port: u16,
    pub discovery_port: u16,
}

pub struct DiscoveryHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
}

impl DiscoveryHandle {
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for join in self.joins {
            let _ = join.join();
        }
    }
}

pub fn start(
    config: DiscoveryConfig,
    registry: Arc<PeerRegistry>,
) -> std::io::Result<DiscoveryHandle> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.discovery_port))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(LISTEN_POLL))?;
    let announce_socket = socket.try_clone()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut joins = Vec::new();

    let announce_shutdown = Arc::clone(&shutdown);
    let announce_config = config.clone();
    joins.push(thread::spawn(move || {
        run_announcer(announce_socket, announce_config, announce_shutdown);
    }));

    let listen_shutdown = Arc::clone(&shutdown);
    joins.push(thread::spawn(move || {
        run_listener(socket, config, registry, listen_shutdown);
    }));

    Ok(DiscoveryHandle { shutdown, joins })
}

fn run_announcer(socket: UdpSocket, config: DiscoveryConfig, shutdown: Arc<AtomicBool>) {
    let broadcast = SocketAddr::from((Ipv4Addr::BROADCAST, config.discovery_port));
    while !shutdown.load(Ordering::Relaxed) {
        match announce_bytes(&config) {
            Ok(bytes) => {
                if let Err(err) = socket.send_to(&bytes, broadcast) {
                    tracing::debug!("discovery broadcast failed: {err}");
                }
            }
            Err(err) => tracing::debug!("discovery announce encode failed: {err}"),
        }
        sleep_until_shutdown(ANNOUNCE_INTERVAL, &shutdown);
    }
}

fn announce_bytes(config: &DiscoveryConfig) -> Result<Vec<u8>, crate::proto::MessageError> {
    Message::discovery_announce(&config.node_id, config.tcp_port)
        .seal()?
        .to_bytes()
}

fn run_listener(
    socket: UdpSocket,
    config: DiscoveryConfig,
    registry: Arc<PeerRegistry>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => handle_datagram(&buf[..n], from, &config, &registry),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) => {
                tracing::debug!("discovery receive failed: {err}");
                thread::sleep(Duration::from_millis(250));
            }
        }
    }
}

fn handle_datagram(
    bytes: &[u8],
    from: SocketAddr,
    config: &DiscoveryConfig,
    registry: &PeerRegistry,
) {
    let msg = match Message::from_slice(bytes) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::debug!(%from, "discarding malformed discovery datagram: {err}");
            return;
        }
    };
    if msg.origin == config.node_id {
        return;
    }
    if let Err(err) = msg.validate() {
        tracing::debug!(%from, origin = %msg.origin, "discarding discovery datagram: {err}");
        return;
    }
    if !matches!(msg.classify(), Ok(Kind::Discovery(_))) {
        tracing::debug!(%from, "ignoring non-discovery datagram on discovery port");
        return;
    }
    let payload = match DiscoveryPayload::from_content(&msg.content) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::debug!(%from, "discarding discovery payload: {err}");
            return;
        }
    };
    let peer_addr = SocketAddr::new(from.ip(), payload.port);
    registry.observe(&msg.origin, peer_addr, Some(payload.version), None);
}

pub(crate) fn sleep_until_shutdown(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        thread::sleep(Duration::from_millis(100).min(deadline - Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    fn config(name: &str) -> DiscoveryConfig {
        DiscoveryConfig {
            node_id: name.to_string(),
            tcp_port: 9000,
            discovery_port: 9050,
        }
    }

    fn registry(name: &str) -> Arc<PeerRegistry> {
        let (tx, _rx) = unbounded();
        Arc::new(PeerRegistry::new(name, tx))
    }

    #[test]
    fn valid_announce_registers_the_sender() {
        let registry = registry("node-a");
        let bytes = announce_bytes(&config("node-b")).unwrap();
        handle_datagram(
            &bytes,
            "192.168.1.7:9050".parse().unwrap(),
            &config("node-a"),
            &registry,
        );
        let peers = registry.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node_id, "node-b");
        assert_eq!(peers[0].addr, "192.168.1.7:9000".parse().unwrap());
    }

    #[test]
    fn self_announce_is_ignored() {
        let registry = registry("node-a");
        let bytes = announce_bytes(&config("node-a")).unwrap();
        handle_datagram(
            &bytes,
            "192.168.1.7:9050".parse().unwrap(),
            &config("node-a"),
            &registry,
        );
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn tampered_announce_is_dropped() {
        let registry = registry("node-a");
        let mut msg = Message::discovery_announce("node-b", 9000).seal().unwrap();
        msg.path = "tampered".to_string();
        handle_datagram(
            &msg.to_bytes().unwrap(),
            "192.168.1.7:9050".parse().unwrap(),
            &config("node-a"),
            &registry,
        );
        assert!(registry.snapshot().is_empty());
    }
}
