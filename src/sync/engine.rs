//! Replication engine.
//!
//! Outbound: successful local mutations are queued as change events; a
//! dispatcher fans each one out to every alive peer through a bounded
//! worker pool, with per-send retry/backoff and a sync-log entry per
//! target. Inbound: `sync_file` payloads are verified, then applied
//! under the commit lock with deterministic last-writer-wins conflict
//! resolution. A periodic tick fails stale pending log entries and
//! re-reconciles with alive peers.

use std::cmp::Ordering as CmpOrdering;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::peer::{PeerEvent, PeerRegistry};
use crate::proto::client::{Client, ClientError};
use crate::proto::message::{
    decode_body, Message, MessageError, MetadataSetPayload, SyncAction, SyncFilePayload, SyncMeta,
};
use crate::store::meta::{
    FileRecord, MetaError, MetadataStore, Operation, SyncLogEntry, SyncStatus,
};
use crate::store::vfs::{sha256_hex, LocalStore, VfsError};
use crate::sync::reconcile;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub node_id: String,
    pub max_sync_threads: usize,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub batch_size: usize,
    pub resync_interval: Duration,
    pub verify_checksums: bool,
    pub client: Client,
}

/// A committed local mutation, ready for fan-out.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub record: FileRecord,
    pub body: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
    KeptLocal,
}

impl ApplyOutcome {
    pub fn describe(self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "file synced",
            ApplyOutcome::Duplicate => "already up to date",
            ApplyOutcome::KeptLocal => "local record wins",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Vfs(#[from] VfsError),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("body checksum mismatch for {path}: expected {expected} got {got}")]
    BodyChecksum {
        path: String,
        expected: String,
        got: String,
    },
    #[error("sync_file for {path} carries no body")]
    MissingBody { path: String },
    #[error("written body failed verification for {path}")]
    WriteVerify { path: String },
    #[error("no record for {path}")]
    NotFound { path: String },
    #[error("peer {peer} rejected {what}: {reason}")]
    PeerRejected {
        peer: String,
        what: &'static str,
        reason: String,
    },
    #[error("payload encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Message(err) => err.kind(),
            EngineError::Vfs(err) => err.kind(),
            EngineError::Meta(err) => err.kind(),
            EngineError::Client(err) => err.kind(),
            EngineError::BodyChecksum { .. } => ErrorKind::Integrity,
            EngineError::MissingBody { .. } => ErrorKind::Protocol,
            EngineError::WriteVerify { .. } | EngineError::Encode(_) => ErrorKind::WriteFailed,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::PeerRejected { .. } => ErrorKind::Unavailable,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Job {
    Deliver {
        peer_id: String,
        addr: SocketAddr,
        bytes: Arc<Vec<u8>>,
        sync_id: Uuid,
    },
    Reconcile {
        peer_id: String,
        addr: SocketAddr,
    },
    PullSet {
        peer_id: String,
        addr: SocketAddr,
        paths: Vec<String>,
    },
}

pub struct SyncEngine {
    pub(crate) config: EngineConfig,
    pub(crate) vfs: Arc<LocalStore>,
    pub(crate) meta: Arc<MetadataStore>,
    pub(crate) registry: Arc<PeerRegistry>,
    commit_lock: Mutex<()>,
    change_tx: Sender<ChangeEvent>,
    change_rx: Receiver<ChangeEvent>,
    job_tx: Sender<Job>,
    job_rx: Receiver<Job>,
    sequence: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

pub struct EngineHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for join in self.joins {
            let _ = join.join();
        }
    }
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        vfs: Arc<LocalStore>,
        meta: Arc<MetadataStore>,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        let (change_tx, change_rx) = unbounded();
        let (job_tx, job_rx) = unbounded();
        Self {
            config,
            vfs,
            meta,
            registry,
            commit_lock: Mutex::new(()),
            change_tx,
            change_rx,
            job_tx,
            job_rx,
            sequence: AtomicU64::new(1),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the dispatcher and the fan-out worker pool.
    pub fn start(self: &Arc<Self>, peer_events: Receiver<PeerEvent>) -> EngineHandle {
        let mut joins = Vec::new();

        let dispatcher = Arc::clone(self);
        joins.push(thread::spawn(move || dispatcher.run_dispatcher(peer_events)));

        for _ in 0..self.config.max_sync_threads.max(1) {
            let worker = Arc::clone(self);
            joins.push(thread::spawn(move || worker.run_worker()));
        }

        EngineHandle {
            shutdown: Arc::clone(&self.shutdown),
            joins,
        }
    }

    /// The metadata writer lock. Command handlers hold this across the
    /// local store mutation, the upsert, and the change enqueue; it is
    /// never held across peer I/O.
    pub fn lock_commit(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().expect("commit lock poisoned")
    }

    pub fn enqueue_change(&self, record: FileRecord, body: Option<Vec<u8>>) {
        let _ = self.change_tx.send(ChangeEvent { record, body });
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn run_dispatcher(&self, peer_events: Receiver<PeerEvent>) {
        let tick = crossbeam::channel::tick(self.config.resync_interval);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            crossbeam::select! {
                recv(self.change_rx) -> event => {
                    let Ok(event) = event else { return };
                    self.fan_out(event);
                }
                recv(peer_events) -> event => {
                    let Ok(event) = event else { return };
                    match event {
                        PeerEvent::Up { node_id, addr } => {
                            let _ = self.job_tx.send(Job::Reconcile { peer_id: node_id, addr });
                        }
                        PeerEvent::Down { node_id } => {
                            tracing::debug!(peer = %node_id, "peer down; outstanding sends will fail fast");
                        }
                    }
                }
                recv(tick) -> _ => {
                    self.run_janitor();
                }
                default(Duration::from_millis(200)) => {}
            }
        }
    }

    fn fan_out(&self, event: ChangeEvent) {
        let peers = self.registry.alive();
        if peers.is_empty() {
            tracing::debug!(path = %event.record.filepath, "no alive peers for fan-out");
            return;
        }

        let payload = SyncFilePayload::from_record(&event.record, event.body.as_deref());
        let content = match serde_json::to_value(&payload) {
            Ok(content) => content,
            Err(err) => {
                tracing::error!(path = %event.record.filepath, "sync payload encode failed: {err}");
                return;
            }
        };
        let mut msg = Message::sync(
            SyncAction::SyncFile,
            &event.record.filepath,
            content,
            &self.config.node_id,
        );
        msg.sequence = self.next_sequence();
        let bytes = match msg.seal().and_then(|m| m.to_bytes()) {
            Ok(bytes) => Arc::new(bytes),
            Err(err) => {
                tracing::error!(path = %event.record.filepath, "sync message encode failed: {err}");
                return;
            }
        };

        tracing::info!(
            path = %event.record.filepath,
            version = event.record.version,
            peers = peers.len(),
            "replicating change"
        );
        for peer in peers {
            let entry = SyncLogEntry::pending(
                &self.config.node_id,
                &peer.node_id,
                &event.record.filepath,
                SyncAction::SyncFile.as_str(),
            );
            if let Err(err) = self.meta.append_sync(&entry) {
                tracing::warn!(peer = %peer.node_id, "sync log append failed: {err}");
            }
            let _ = self.job_tx.send(Job::Deliver {
                peer_id: peer.node_id,
                addr: peer.addr,
                bytes: Arc::clone(&bytes),
                sync_id: entry.sync_id,
            });
        }
    }

    fn run_worker(&self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            match self.job_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(Job::Deliver {
                    peer_id,
                    addr,
                    bytes,
                    sync_id,
                }) => self.run_deliver(&peer_id, addr, &bytes, sync_id),
                Ok(Job::Reconcile { peer_id, addr }) => {
                    match reconcile::reconcile_with_peer(self, &peer_id, addr) {
                        Ok(pulled) if pulled > 0 => {
                            tracing::info!(peer = %peer_id, pulled, "reconciliation complete");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(peer = %peer_id, "reconciliation failed: {err}");
                        }
                    }
                }
                Ok(Job::PullSet {
                    peer_id,
                    addr,
                    paths,
                }) => {
                    if let Err(err) = reconcile::pull_files(self, &peer_id, addr, &paths) {
                        tracing::warn!(peer = %peer_id, "pull failed: {err}");
                    }
                }
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// One per-peer delivery with bounded retry. Transport errors back
    /// off and retry; a response from the peer, success or not, is
    /// final — the peer saw the message, retrying cannot change its
    /// answer.
    fn run_deliver(&self, peer_id: &str, addr: SocketAddr, bytes: &[u8], sync_id: Uuid) {
        let attempts = self.config.retry_attempts.max(1);
        let mut delay = self.config.retry_backoff;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if self.shutdown.load(Ordering::Relaxed) {
                self.resolve(sync_id, SyncStatus::Failed, Some("shutdown"));
                return;
            }
            if !self.registry.contains(peer_id) {
                self.resolve(sync_id, SyncStatus::Failed, Some("peer evicted"));
                return;
            }

            match self.config.client.call_bytes(addr, bytes) {
                Ok(response) => {
                    let resolved = match crate::proto::message::ResponsePayload::from_content(
                        &response.content,
                    ) {
                        Ok(payload) if payload.success => {
                            self.resolve(sync_id, SyncStatus::Success, None);
                            return;
                        }
                        Ok(payload) => payload.message,
                        Err(err) => err.to_string(),
                    };
                    self.resolve(sync_id, SyncStatus::Failed, Some(&resolved));
                    return;
                }
                Err(err) => {
                    last_error = err.to_string();
                    tracing::debug!(
                        peer = peer_id,
                        attempt,
                        "sync delivery failed: {last_error}"
                    );
                }
            }

            if attempt < attempts {
                self.sleep_interruptible(delay);
                delay = delay.checked_mul(2).unwrap_or(delay);
            }
        }
        self.resolve(sync_id, SyncStatus::Failed, Some(&last_error));
    }

    fn resolve(&self, sync_id: Uuid, status: SyncStatus, error: Option<&str>) {
        if let Err(err) = self.meta.resolve_sync(sync_id, status, error) {
            tracing::warn!("sync log resolve failed: {err}");
        }
    }

    fn run_janitor(&self) {
        let horizon =
            crate::proto::message::unix_now() - self.config.resync_interval.as_secs_f64();
        match self.meta.fail_stale_pending(horizon) {
            Ok(0) => {}
            Ok(n) => tracing::warn!(entries = n, "failed stale pending sync entries"),
            Err(err) => tracing::warn!("stale pending sweep failed: {err}"),
        }
        for peer in self.registry.alive() {
            let _ = self.job_tx.send(Job::Reconcile {
                peer_id: peer.node_id,
                addr: peer.addr,
            });
        }
    }

    fn sleep_interruptible(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_millis(50).min(deadline - Instant::now()));
        }
    }

    /// Applies an inbound `sync/sync_file` message and records the
    /// attempt in the sync log.
    pub fn apply_sync_file(&self, msg: &Message) -> Result<ApplyOutcome, EngineError> {
        let payload = SyncFilePayload::from_content(&msg.content)?;
        let result = self.apply_payload(&msg.path, &payload, &msg.origin);

        let mut entry = SyncLogEntry::pending(
            &msg.origin,
            &self.config.node_id,
            &msg.path,
            SyncAction::SyncFile.as_str(),
        );
        match &result {
            Ok(_) => entry.status = SyncStatus::Success,
            Err(err) => {
                entry.status = SyncStatus::Failed;
                entry.error_message = Some(err.to_string());
            }
        }
        if let Err(err) = self.meta.append_sync(&entry) {
            tracing::warn!("inbound sync log append failed: {err}");
        }
        result
    }

    /// Core inbound apply: verify, decide, install. `sender` is the
    /// node the payload arrived from; the record's own origin lives in
    /// the metadata.
    pub fn apply_payload(
        &self,
        path: &str,
        payload: &SyncFilePayload,
        sender: &str,
    ) -> Result<ApplyOutcome, EngineError> {
        let body = payload.data.as_deref().map(decode_body).transpose()?;
        let remote = record_from_meta(path, &payload.metadata);

        if self.config.verify_checksums
            && !remote.is_deleted
            && let Some(body) = &body
        {
            let got = sha256_hex(body);
            if got != remote.checksum {
                return Err(EngineError::BodyChecksum {
                    path: path.to_string(),
                    expected: remote.checksum,
                    got,
                });
            }
        }
        // Reject escaping paths before touching any state.
        self.vfs.resolve(path)?;

        let _guard = self.lock_commit();
        let local = self.meta.get(path)?;
        let outcome = match decide(local.as_ref(), &remote) {
            Decision::Duplicate => ApplyOutcome::Duplicate,
            Decision::ApplyRemote { version } => {
                let mut winner = remote;
                winner.version = version;
                if let Some(local) = &local
                    && local.created_time < winner.created_time
                {
                    winner.created_time = local.created_time;
                }
                self.install(&winner, body.as_deref())?;
                tracing::info!(
                    path,
                    version = winner.version,
                    origin = %winner.origin,
                    from = sender,
                    "applied remote change"
                );
                ApplyOutcome::Applied
            }
            Decision::KeepLocal { bump_to } => {
                if let Some(version) = bump_to
                    && let Some(local) = local
                {
                    let mut kept = local;
                    kept.version = version;
                    self.meta.upsert(&kept)?;
                    tracing::info!(
                        path,
                        version,
                        "conflict resolved toward local record"
                    );
                }
                ApplyOutcome::KeptLocal
            }
        };
        Ok(outcome)
    }

    fn install(&self, record: &FileRecord, body: Option<&[u8]>) -> Result<(), EngineError> {
        if record.is_deleted {
            self.vfs.delete(&record.filepath)?;
            self.meta.upsert(record)?;
            return Ok(());
        }
        if record.last_operation == Operation::Mkdir {
            self.vfs.mkdir(&record.filepath)?;
            self.meta.upsert(record)?;
            return Ok(());
        }

        let Some(body) = body else {
            return Err(EngineError::MissingBody {
                path: record.filepath.clone(),
            });
        };
        let prior = self.vfs.read(&record.filepath).ok();
        self.vfs.write(&record.filepath, body)?;
        let written = self.vfs.hash(&record.filepath)?;
        if written != record.checksum {
            self.restore_body(&record.filepath, prior.as_deref());
            return Err(EngineError::WriteVerify {
                path: record.filepath.clone(),
            });
        }
        if let Err(err) = self.meta.upsert(record) {
            self.restore_body(&record.filepath, prior.as_deref());
            return Err(err.into());
        }
        Ok(())
    }

    fn restore_body(&self, path: &str, prior: Option<&[u8]>) {
        let result = match prior {
            Some(bytes) => self.vfs.write(path, bytes).map(|_| ()),
            None => self.vfs.delete(path),
        };
        if let Err(err) = result {
            tracing::error!(path, "failed to restore prior body: {err}");
        }
    }

    /// Handles an inbound `sync_metadata` exchange: schedules pulls for
    /// everything the sender has newer, and returns our own full set
    /// for the response.
    pub fn handle_metadata_set(
        &self,
        sender: &str,
        theirs: &MetadataSetPayload,
    ) -> Result<MetadataSetPayload, EngineError> {
        let ours = MetadataSetPayload::from_records(self.meta.all_records()?.iter());
        let wants = reconcile::diff_wanted(&ours, theirs);
        if !wants.is_empty() {
            if let Some(addr) = self.registry.addr_of(sender) {
                let _ = self.job_tx.send(Job::PullSet {
                    peer_id: sender.to_string(),
                    addr,
                    paths: wants,
                });
            } else {
                tracing::debug!(peer = sender, "peer has newer records but its address is unknown");
            }
        }
        Ok(ours)
    }

    /// Serves a `request_file` pull from the local record and body.
    pub fn serve_file(&self, path: &str) -> Result<SyncFilePayload, EngineError> {
        let record = self.meta.get(path)?.ok_or_else(|| EngineError::NotFound {
            path: path.to_string(),
        })?;
        let body = if record.is_deleted || record.last_operation == Operation::Mkdir {
            None
        } else {
            Some(self.vfs.read(path)?)
        };
        Ok(SyncFilePayload::from_record(&record, body.as_deref()))
    }

    pub(crate) fn submit(&self, job: Job) {
        let _ = self.job_tx.send(job);
    }
}

fn record_from_meta(path: &str, meta: &SyncMeta) -> FileRecord {
    FileRecord {
        filepath: path.to_string(),
        checksum: meta.checksum.clone(),
        size: meta.size,
        version: meta.version,
        modified_time: meta.modified_time,
        created_time: meta.created_time,
        origin: meta.origin.clone(),
        last_operation: meta.operation,
        is_deleted: meta.is_deleted || meta.operation == Operation::Delete,
    }
}

enum Decision {
    Duplicate,
    ApplyRemote { version: u64 },
    KeepLocal { bump_to: Option<u64> },
}

/// The convergence rule. Version strictly greater fast-forwards; an
/// identical record is an idempotent duplicate; anything else is a
/// concurrent mutation resolved by last-writer-wins on the record
/// timestamp, ties to the lexicographically greater origin. The winner
/// ends strictly newer than both inputs so it wins everywhere else too.
fn decide(local: Option<&FileRecord>, remote: &FileRecord) -> Decision {
    let Some(local) = local else {
        return Decision::ApplyRemote {
            version: remote.version,
        };
    };
    if remote.version > local.version {
        return Decision::ApplyRemote {
            version: remote.version,
        };
    }
    if remote.version == local.version
        && remote.checksum == local.checksum
        && remote.origin == local.origin
        && remote.is_deleted == local.is_deleted
    {
        return Decision::Duplicate;
    }

    let remote_wins = match remote.modified_time.partial_cmp(&local.modified_time) {
        Some(CmpOrdering::Greater) => true,
        Some(CmpOrdering::Less) => false,
        _ => remote.origin > local.origin,
    };
    if remote_wins {
        // local.version >= remote.version in this branch, so this is
        // max(local, remote) + 1.
        Decision::ApplyRemote {
            version: local.version + 1,
        }
    } else if local.version == remote.version {
        Decision::KeepLocal {
            bump_to: Some(remote.version + 1),
        }
    } else {
        // Local already strictly newer; leaving it untouched keeps
        // repeated application of the same message a no-op.
        Decision::KeepLocal { bump_to: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: u64, ts: f64, origin: &str, checksum: &str) -> FileRecord {
        FileRecord {
            filepath: "f".to_string(),
            checksum: checksum.to_string(),
            size: 1,
            version,
            modified_time: ts,
            created_time: 1.0,
            origin: origin.to_string(),
            last_operation: Operation::Modify,
            is_deleted: false,
        }
    }

    #[test]
    fn missing_local_applies_remote_as_is() {
        let remote = record(3, 100.0, "node-b", "b");
        assert!(matches!(
            decide(None, &remote),
            Decision::ApplyRemote { version: 3 }
        ));
    }

    #[test]
    fn strictly_newer_version_fast_forwards() {
        let local = record(1, 200.0, "node-a", "a");
        let remote = record(2, 100.0, "node-b", "b");
        assert!(matches!(
            decide(Some(&local), &remote),
            Decision::ApplyRemote { version: 2 }
        ));
    }

    #[test]
    fn identical_record_is_duplicate() {
        let local = record(2, 100.0, "node-b", "b");
        let remote = record(2, 100.0, "node-b", "b");
        assert!(matches!(decide(Some(&local), &remote), Decision::Duplicate));
    }

    #[test]
    fn later_timestamp_wins_and_bumps_above_both() {
        // Partitioned writes: both at version 1, remote written later.
        let local = record(1, 100.1, "node-a", "a");
        let remote = record(1, 100.2, "node-b", "b");
        assert!(matches!(
            decide(Some(&local), &remote),
            Decision::ApplyRemote { version: 2 }
        ));

        // Mirror image: remote older loses, local bumps to stay ahead.
        let local = record(1, 100.2, "node-b", "b");
        let remote = record(1, 100.1, "node-a", "a");
        assert!(matches!(
            decide(Some(&local), &remote),
            Decision::KeepLocal { bump_to: Some(2) }
        ));
    }

    #[test]
    fn timestamp_tie_breaks_toward_greater_origin() {
        let local = record(1, 100.0, "node-a", "a");
        let remote = record(1, 100.0, "node-b", "b");
        assert!(matches!(
            decide(Some(&local), &remote),
            Decision::ApplyRemote { version: 2 }
        ));

        let local = record(1, 100.0, "node-b", "b");
        let remote = record(1, 100.0, "node-a", "a");
        assert!(matches!(
            decide(Some(&local), &remote),
            Decision::KeepLocal { bump_to: Some(2) }
        ));
    }

    #[test]
    fn resolved_conflict_reapplied_is_a_no_op() {
        // First application: remote wins the tie on origin and lands
        // at version 2 with remote's fields.
        let local = record(1, 100.0, "node-a", "a");
        let remote = record(1, 100.0, "node-b", "b");
        let Decision::ApplyRemote { version } = decide(Some(&local), &remote) else {
            panic!("remote should win");
        };
        let mut installed = remote.clone();
        installed.version = version;

        // Redelivery of the same message now keeps local, no bump.
        assert!(matches!(
            decide(Some(&installed), &remote),
            Decision::KeepLocal { bump_to: None }
        ));
    }

    #[test]
    fn delete_tombstone_with_later_timestamp_beats_a_write() {
        let local = record(2, 100.0, "node-a", "a");
        let mut tombstone = record(2, 150.0, "node-b", "");
        tombstone.is_deleted = true;
        tombstone.last_operation = Operation::Delete;
        assert!(matches!(
            decide(Some(&local), &tombstone),
            Decision::ApplyRemote { version: 3 }
        ));
    }
}
