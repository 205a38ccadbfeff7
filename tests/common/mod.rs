//! Shared fixtures: loopback nodes with ephemeral ports, static seeds,
//! and discovery disabled so suites do not interfere.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::Value;

use meshfs::config::Config;
use meshfs::daemon::{NodeDaemon, NodeHandle};
use meshfs::proto::client::Client;
use meshfs::proto::message::{CommandAction, Message, ResponsePayload};

pub fn node_config(name: &str, root: &Path, seeds: &[SocketAddr]) -> Config {
    let mut cfg = Config::default();
    cfg.node.name = name.to_string();
    cfg.network.tcp_port = 0;
    cfg.network.bind_address = "127.0.0.1".to_string();
    cfg.network.discovery_enabled = false;
    cfg.network.heartbeat_interval_secs = 1;
    cfg.network.reconnect_timeout_secs = 3;
    cfg.network.connect_timeout_secs = 2;
    cfg.network.io_deadline_secs = 5;
    cfg.filesystem.root_path = root.to_path_buf();
    cfg.sync.resync_interval_secs = 2;
    cfg.sync.retry_backoff_ms = 100;
    cfg.peers = seeds.iter().map(|addr| addr.to_string()).collect();
    cfg
}

pub fn start_node(name: &str, root: &Path, seeds: &[SocketAddr]) -> NodeHandle {
    NodeDaemon::start(node_config(name, root, seeds)).expect("start node")
}

pub fn client() -> Client {
    Client::new(
        Duration::from_secs(2),
        Duration::from_secs(5),
        64 * 1024 * 1024,
    )
}

/// Sends one command and returns the response payload.
pub fn command(
    addr: SocketAddr,
    action: CommandAction,
    path: &str,
    content: Value,
) -> ResponsePayload {
    let msg = Message::command(action, path, content, "shell")
        .seal()
        .expect("seal command");
    let (_, payload) = client().call_expect(addr, &msg).expect("command call");
    payload
}

/// Polls until the condition holds or the timeout passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}
