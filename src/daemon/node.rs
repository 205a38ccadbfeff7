//! Node daemon: owns every component, starts them in dependency order,
//! and tears them down in reverse.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::Config;
use crate::daemon::handlers::Handlers;
use crate::daemon::server::{BoundServer, ServerConfig, ServerHandle};
use crate::peer::discovery::{self, DiscoveryConfig, DiscoveryHandle};
use crate::peer::heartbeat::{self, HeartbeatConfig, HeartbeatHandle};
use crate::peer::{Peer, PeerRegistry};
use crate::proto::client::Client;
use crate::proto::message::unix_now;
use crate::store::meta::{FileRecord, MetadataStore, Operation};
use crate::store::vfs::LocalStore;
use crate::sync::engine::{EngineConfig, EngineHandle, SyncEngine};
use crate::{Error, Result};

pub struct NodeDaemon;

pub struct NodeHandle {
    node_id: String,
    tcp_addr: SocketAddr,
    registry: Arc<PeerRegistry>,
    meta: Arc<MetadataStore>,
    vfs: Arc<LocalStore>,
    engine_handle: Option<EngineHandle>,
    heartbeat: Option<HeartbeatHandle>,
    discovery: Option<DiscoveryHandle>,
    server: Option<ServerHandle>,
}

impl NodeDaemon {
    /// Startup order: metadata store, local store, optional startup
    /// scan, TCP bind, UDP bind + discovery, heartbeat, replication
    /// engine, ready.
    pub fn start(config: Config) -> Result<NodeHandle> {
        config.validate().map_err(Error::Config)?;
        let node_id = config.node.name.clone();

        let meta = Arc::new(MetadataStore::open(&config.metadata_db_path())?);
        let vfs = Arc::new(LocalStore::open_with_chunk(
            &config.filesystem.root_path,
            config.sync.chunk_size,
        )?);

        if config.filesystem.sync_on_startup {
            let scanned = startup_scan(&vfs, &meta, &node_id, &config.filesystem.metadata_db)?;
            if scanned > 0 {
                tracing::info!(records = scanned, "startup scan updated metadata");
            }
        }

        let server = BoundServer::bind(ServerConfig {
            bind_address: config.network.bind_address.clone(),
            tcp_port: config.network.tcp_port,
            io_deadline: config.io_deadline(),
            max_frame_bytes: config.network.max_frame_bytes,
            max_connections: config.network.max_connections,
        })?;
        let tcp_addr = server.local_addr();

        let (event_tx, event_rx) = crossbeam::channel::unbounded();
        let registry = Arc::new(PeerRegistry::new(&node_id, event_tx));

        let client = Client::new(
            config.connect_timeout(),
            config.io_deadline(),
            config.network.max_frame_bytes,
        );
        let engine = Arc::new(SyncEngine::new(
            EngineConfig {
                node_id: node_id.clone(),
                max_sync_threads: config.sync.max_sync_threads,
                retry_attempts: config.sync.retry_attempts,
                retry_backoff: config.retry_backoff(),
                batch_size: config.sync.batch_size,
                resync_interval: config.resync_interval(),
                verify_checksums: config.sync.verify_checksums,
                client,
            },
            Arc::clone(&vfs),
            Arc::clone(&meta),
            Arc::clone(&registry),
        ));

        let stats = stats_provider(
            node_id.clone(),
            tcp_addr.port(),
            Arc::clone(&meta),
            Arc::clone(&vfs),
        );

        let handlers = Arc::new(Handlers {
            node_id: node_id.clone(),
            registry: Arc::clone(&registry),
            vfs: Arc::clone(&vfs),
            meta: Arc::clone(&meta),
            engine: Arc::clone(&engine),
            verify_checksums: config.sync.verify_checksums,
            stats: Arc::clone(&stats),
        });
        let server = server.start(handlers)?;

        let discovery = if config.network.discovery_enabled {
            match discovery::start(
                DiscoveryConfig {
                    node_id: node_id.clone(),
                    tcp_port: tcp_addr.port(),
                    discovery_port: config.network.discovery_port,
                },
                Arc::clone(&registry),
            ) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    tracing::warn!("discovery disabled, udp bind failed: {err}");
                    None
                }
            }
        } else {
            None
        };

        let seeds = config.seed_addrs();
        let heartbeat = heartbeat::start(
            HeartbeatConfig {
                node_id: node_id.clone(),
                interval: config.heartbeat_interval(),
                reconnect_timeout: config.reconnect_timeout(),
                failure_threshold: config.network.heartbeat_failure_threshold,
                seeds: seeds.clone(),
                client,
            },
            Arc::clone(&registry),
            {
                let stats = Arc::clone(&stats);
                move || stats()
            },
        );

        let engine_handle = engine.start(event_rx);
        for seed in seeds {
            registry.add_seed(seed);
        }

        tracing::info!(node = %node_id, %tcp_addr, "node ready");
        Ok(NodeHandle {
            node_id,
            tcp_addr,
            registry,
            meta,
            vfs,
            engine_handle: Some(engine_handle),
            heartbeat: Some(heartbeat),
            discovery,
            server: Some(server),
        })
    }
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.registry.snapshot()
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.meta
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.vfs
    }

    /// Reverse of the startup order, joining each service's threads.
    pub fn shutdown(mut self) {
        tracing::info!(node = %self.node_id, "shutting down");
        if let Some(engine) = self.engine_handle.take() {
            engine.shutdown();
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.shutdown();
        }
        if let Some(discovery) = self.discovery.take() {
            discovery.shutdown();
        }
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        tracing::info!(node = %self.node_id, "stopped");
    }
}

fn stats_provider(
    node_id: String,
    tcp_port: u16,
    meta: Arc<MetadataStore>,
    vfs: Arc<LocalStore>,
) -> Arc<dyn Fn() -> Value + Send + Sync> {
    Arc::new(move || {
        let meta_stats = meta.stats().unwrap_or_default();
        let store_stats = vfs.stats();
        json!({
            "node": node_id,
            "tcp_port": tcp_port,
            "active_files": meta_stats.active_files,
            "tombstones": meta_stats.tombstones,
            "total_size": meta_stats.total_size,
            "recent_syncs": meta_stats.recent_syncs,
            "local_files": store_stats.total_files,
            "local_dirs": store_stats.total_dirs,
            "local_bytes": store_stats.total_size,
        })
    })
}

/// Brings metadata in line with whatever is on disk at startup: new or
/// changed files get fresh records. No fan-out; the next
/// reconciliation propagates anything peers are missing.
fn startup_scan(
    vfs: &LocalStore,
    meta: &MetadataStore,
    node_id: &str,
    metadata_db: &str,
) -> Result<usize> {
    let mut changed = 0usize;
    for path in vfs.walk()? {
        // The metadata database and its WAL sidecars live at the root
        // but are not part of the replicated namespace.
        if path.starts_with(metadata_db) {
            continue;
        }
        let checksum = vfs.hash(&path)?;
        let prior = meta.get(&path)?;
        if prior
            .as_ref()
            .is_some_and(|r| !r.is_deleted && r.checksum == checksum)
        {
            continue;
        }
        let now = unix_now();
        let operation = match &prior {
            Some(r) if !r.is_deleted => Operation::Modify,
            _ => Operation::Create,
        };
        let record = FileRecord {
            filepath: path.clone(),
            checksum,
            size: vfs.size(&path)?,
            version: meta.next_version(&path)?,
            modified_time: now,
            created_time: prior
                .as_ref()
                .filter(|r| !r.is_deleted)
                .map_or(now, |r| r.created_time),
            origin: node_id.to_string(),
            last_operation: operation,
            is_deleted: false,
        };
        meta.upsert(&record)?;
        changed += 1;
    }
    Ok(changed)
}
