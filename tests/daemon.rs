//! Daemon lifecycle, command surface, and peer liveness.

mod common;

use std::time::Duration;

use serde_json::{json, Value};

use common::{client, command, node_config, start_node, wait_until};
use meshfs::daemon::NodeDaemon;
use meshfs::proto::message::{encode_body, CommandAction, Message};

#[test]
fn restart_preserves_metadata_and_versions() {
    let root = tempfile::tempdir().unwrap();

    let node = start_node("node-a", root.path(), &[]);
    let addr_file = |payload: &[u8]| Value::String(encode_body(payload));
    assert!(command(node.tcp_addr(), CommandAction::Write, "a.txt", addr_file(b"one")).success);
    assert!(command(node.tcp_addr(), CommandAction::Write, "a.txt", addr_file(b"two")).success);
    node.shutdown();

    let node = NodeDaemon::start(node_config("node-a", root.path(), &[])).unwrap();
    let record = node.metadata().get("a.txt").unwrap().unwrap();
    assert_eq!(record.version, 2);

    // The version sequence continues after restart.
    assert!(command(node.tcp_addr(), CommandAction::Write, "a.txt", addr_file(b"three")).success);
    assert_eq!(node.metadata().get("a.txt").unwrap().unwrap().version, 3);
    node.shutdown();
}

#[test]
fn command_surface_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let node = start_node("node-a", root.path(), &[]);
    let addr = node.tcp_addr();

    // create twice -> exists
    assert!(command(addr, CommandAction::Create, "f.txt", Value::Null).success);
    let dup = command(addr, CommandAction::Create, "f.txt", Value::Null);
    assert!(!dup.success);
    assert!(dup.message.starts_with("exists"), "{}", dup.message);

    // read of a missing path -> not_found
    let missing = command(addr, CommandAction::Read, "ghost.txt", Value::Null);
    assert!(!missing.success);
    assert!(missing.message.starts_with("not_found"));

    // path escape -> invalid_path
    let escape = command(addr, CommandAction::Read, "../../etc/passwd", Value::Null);
    assert!(!escape.success);
    assert!(escape.message.starts_with("invalid_path"));

    // delete is idempotent
    assert!(command(addr, CommandAction::Delete, "f.txt", Value::Null).success);
    assert!(command(addr, CommandAction::Delete, "f.txt", Value::Null).success);

    // history shows the operations
    let history = command(addr, CommandAction::History, "", json!({ "limit": 10 }));
    assert!(history.success);
    let rows = history.data.as_array().expect("history rows");
    assert!(!rows.is_empty());

    node.shutdown();
}

#[test]
fn unknown_actions_and_tampered_checksums_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    let node = start_node("node-a", root.path(), &[]);

    // Unknown (type, action) pair.
    let mut msg = Message::command(CommandAction::List, "", Value::Null, "shell");
    msg.action = "format".to_string();
    let msg = msg.seal().unwrap();
    let (_, payload) = client().call_expect(node.tcp_addr(), &msg).unwrap();
    assert!(!payload.success);
    assert!(payload.message.starts_with("protocol"), "{}", payload.message);

    // Valid message, corrupted checksum.
    let mut msg = Message::command(CommandAction::List, "", Value::Null, "shell")
        .seal()
        .unwrap();
    msg.checksum = "0000000000000000".to_string();
    let (_, payload) = client().call_expect(node.tcp_addr(), &msg).unwrap();
    assert!(!payload.success);
    assert!(payload.message.starts_with("integrity"));

    // Stale timestamp.
    let mut msg = Message::command(CommandAction::List, "", Value::Null, "shell");
    msg.timestamp -= 3_600.0;
    let msg = msg.seal().unwrap();
    let (_, payload) = client().call_expect(node.tcp_addr(), &msg).unwrap();
    assert!(!payload.success);
    assert!(payload.message.starts_with("stale"));

    node.shutdown();
}

#[test]
fn heartbeats_name_seeded_peers_and_reaping_clears_dead_ones() {
    let root_a = tempfile::tempdir().unwrap();
    let root_b = tempfile::tempdir().unwrap();

    let a = start_node("node-a", root_a.path(), &[]);
    let b = start_node("node-b", root_b.path(), &[a.tcp_addr()]);

    // The seed starts out keyed by address; the first pong names it.
    assert!(wait_until(Duration::from_secs(10), || {
        b.peers().iter().any(|p| p.node_id == "node-a")
    }));
    // And A learns B from B's pings.
    assert!(wait_until(Duration::from_secs(10), || {
        a.peers().iter().any(|p| p.node_id == "node-b")
    }));

    // Kill B; within reconnect_timeout + a few failed probes A must
    // have no trace of it.
    b.shutdown();
    assert!(wait_until(Duration::from_secs(10), || a.peers().is_empty()));

    a.shutdown();
}

#[test]
fn startup_scan_registers_preexisting_files() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("docs")).unwrap();
    std::fs::write(root.path().join("docs/pre.txt"), b"already here").unwrap();

    let node = start_node("node-a", root.path(), &[]);
    let record = node.metadata().get("docs/pre.txt").unwrap().expect("scanned record");
    assert_eq!(record.version, 1);
    assert_eq!(record.origin, "node-a");
    assert_eq!(
        record.checksum,
        meshfs::store::vfs::sha256_hex(b"already here")
    );

    // The metadata database itself is not part of the namespace.
    assert!(node.metadata().get("metadata.db").unwrap().is_none());
    node.shutdown();
}
