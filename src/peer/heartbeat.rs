//! Heartbeat: periodic ping/pong over fresh TCP connections.
//!
//! Each tick reaps silent peers, then pings every remaining peer on a
//! new connection. A successful round trip refreshes liveness (and
//! names address-keyed seeds); repeated failures walk a peer to dead
//! and evict it. When every peer is gone for longer than the reconnect
//! timeout, static seeds are re-introduced.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::peer::discovery::sleep_until_shutdown;
use crate::peer::{Peer, PeerRegistry};
use crate::proto::client::{Client, ClientError};
use crate::proto::message::Message;

#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    pub node_id: String,
    pub interval: Duration,
    pub reconnect_timeout: Duration,
    pub failure_threshold: u32,
    pub seeds: Vec<SocketAddr>,
    pub client: Client,
}

pub struct HeartbeatHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

pub fn start<S>(config: HeartbeatConfig, registry: Arc<PeerRegistry>, stats: S) -> HeartbeatHandle
where
    S: Fn() -> Value + Send + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let loop_shutdown = Arc::clone(&shutdown);
    let join = thread::spawn(move || run_loop(config, registry, stats, loop_shutdown));
    HeartbeatHandle { shutdown, join }
}

fn run_loop<S>(
    config: HeartbeatConfig,
    registry: Arc<PeerRegistry>,
    stats: S,
    shutdown: Arc<AtomicBool>,
) where
    S: Fn() -> Value,
{
    let mut last_alive = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        registry.reap(config.reconnect_timeout);

        for peer in registry.snapshot() {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            match ping_peer(&config, &peer, &stats) {
                Ok((origin, peer_stats)) => {
                    registry.promote(peer.addr, &origin, peer_stats);
                }
                Err(err) => {
                    tracing::debug!(peer = %peer.node_id, "heartbeat failed: {err}");
                    registry.record_failure(&peer.node_id, config.failure_threshold);
                }
            }
        }

        if registry.alive().is_empty() {
            if !config.seeds.is_empty() && last_alive.elapsed() > config.reconnect_timeout {
                tracing::info!("no alive peers; re-introducing static seeds");
                for seed in &config.seeds {
                    registry.add_seed(*seed);
                }
                last_alive = Instant::now();
            }
        } else {
            last_alive = Instant::now();
        }

        sleep_until_shutdown(config.interval, &shutdown);
    }
}

/// One ping round trip. Returns the responder's node id and its stats
/// snapshot.
fn ping_peer<S>(
    config: &HeartbeatConfig,
    peer: &Peer,
    stats: &S,
) -> Result<(String, Option<Value>), ClientError>
where
    S: Fn() -> Value,
{
    let ping = Message::heartbeat_ping(&config.node_id, stats()).seal()?;
    let (response, payload) = config.client.call_expect(peer.addr, &ping)?;
    if !payload.success || response.action != "pong" {
        return Err(ClientError::UnexpectedReply {
            kind: response.kind,
            action: response.action,
        });
    }
    let peer_stats = (!payload.data.is_null()).then_some(payload.data);
    Ok((response.origin, peer_stats))
}
