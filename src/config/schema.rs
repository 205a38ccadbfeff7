//! Configuration schema: one TOML file per node.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub filesystem: FilesystemConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
    /// Optional static `host:port` seeds for clusters without working
    /// UDP broadcast.
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node id; used as the `origin` of every message.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub tcp_port: u16,
    pub discovery_port: u16,
    pub bind_address: String,
    pub discovery_enabled: bool,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_failure_threshold: u32,
    pub reconnect_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub io_deadline_secs: u64,
    pub max_frame_bytes: usize,
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_port: 9000,
            discovery_port: 9050,
            bind_address: "0.0.0.0".to_string(),
            discovery_enabled: true,
            heartbeat_interval_secs: 5,
            heartbeat_failure_threshold: 3,
            reconnect_timeout_secs: 30,
            connect_timeout_secs: 10,
            io_deadline_secs: 30,
            max_frame_bytes: crate::proto::frame::DEFAULT_MAX_FRAME_BYTES,
            max_connections: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    pub root_path: PathBuf,
    pub metadata_db: String,
    pub sync_on_startup: bool,
    pub conflict_resolution: ConflictResolution,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            metadata_db: "metadata.db".to_string(),
            sync_on_startup: true,
            conflict_resolution: ConflictResolution::Timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Last-writer-wins on the record timestamp, ties to the greater
    /// origin. The only implemented policy.
    Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub chunk_size: usize,
    pub verify_checksums: bool,
    pub max_sync_threads: usize,
    pub resync_interval_secs: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            chunk_size: 1024 * 1024,
            verify_checksums: true,
            max_sync_threads: 4,
            resync_interval_secs: 300,
            retry_attempts: 3,
            retry_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// File logging directory; unset means stderr only.
    pub dir: Option<PathBuf>,
    /// Total bytes kept across rotated log files.
    pub max_file_size: u64,
    /// Rotated files kept.
    pub backup_count: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            max_file_size: 50 * 1024 * 1024,
            backup_count: 5,
        }
    }
}

fn default_root_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("C:\\MeshFS")
    } else {
        PathBuf::from("/var/lib/meshfs")
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.node.name.trim().is_empty() {
            return Err("node.name is required".to_string());
        }
        if self.node.name.contains(char::is_whitespace) {
            return Err("node.name must not contain whitespace".to_string());
        }
        for peer in &self.peers {
            if peer.to_socket_addrs().is_err() {
                return Err(format!("peers entry {peer:?} is not a resolvable host:port"));
            }
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.network.heartbeat_interval_secs.max(1))
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.reconnect_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_secs.max(1))
    }

    pub fn io_deadline(&self) -> Duration {
        Duration::from_secs(self.network.io_deadline_secs.max(1))
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.resync_interval_secs.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.sync.retry_backoff_ms.max(1))
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.filesystem.root_path.join(&self.filesystem.metadata_db)
    }

    /// Resolved static seeds; unresolvable entries were already
    /// rejected by `validate`.
    pub fn seed_addrs(&self) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter_map(|peer| match peer.to_socket_addrs() {
                Ok(mut addrs) => addrs.next(),
                Err(err) => {
                    tracing::warn!(peer, "skipping unresolvable seed: {err}");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_ports() {
        let cfg = Config::default();
        assert_eq!(cfg.network.tcp_port, 9000);
        assert_eq!(cfg.network.discovery_port, 9050);
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
        assert_eq!(cfg.sync.batch_size, 10);
        assert_eq!(cfg.sync.retry_attempts, 3);
        assert_eq!(cfg.filesystem.metadata_db, "metadata.db");
        assert!(cfg.filesystem.sync_on_startup);
    }

    #[test]
    fn empty_node_name_fails_validation() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.node.name = "node-a".to_string();
        cfg.validate().unwrap();

        cfg.node.name = "node a".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_seed_fails_validation() {
        let mut cfg = Config::default();
        cfg.node.name = "node-a".to_string();
        cfg.peers = vec!["not a peer".to_string()];
        assert!(cfg.validate().is_err());

        cfg.peers = vec!["127.0.0.1:9000".to_string()];
        cfg.validate().unwrap();
        assert_eq!(cfg.seed_addrs(), vec!["127.0.0.1:9000".parse().unwrap()]);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [node]
            name = "node-a"

            [network]
            tcp_port = 9100
            "#,
        )
        .unwrap();
        assert_eq!(cfg.node.name, "node-a");
        assert_eq!(cfg.network.tcp_port, 9100);
        assert_eq!(cfg.network.discovery_port, 9050);
        assert_eq!(cfg.sync.max_sync_threads, 4);
    }
}
