//! Request dispatch: one handler per classified (type, action) pair.
//!
//! Clients and peers speak the same protocol, so the six file commands,
//! the sync actions, and heartbeats all dispatch from here. Every
//! mutation runs under the engine's commit lock and enqueues its
//! replication event before the lock is released.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::peer::PeerRegistry;
use crate::proto::message::{
    decode_body, encode_body, unix_now, CommandAction, Kind, Message, MessageError,
    MetadataSetPayload, SyncAction,
};
use crate::store::meta::{FileRecord, MetaError, MetadataStore, Operation};
use crate::store::vfs::{sha256_hex, LocalStore, VfsError};
use crate::sync::engine::{EngineError, SyncEngine};

pub struct Handlers {
    pub node_id: String,
    pub registry: Arc<PeerRegistry>,
    pub vfs: Arc<LocalStore>,
    pub meta: Arc<MetadataStore>,
    pub engine: Arc<SyncEngine>,
    pub verify_checksums: bool,
    pub stats: Arc<dyn Fn() -> Value + Send + Sync>,
}

#[derive(Debug, Error)]
enum HandlerError {
    #[error(transparent)]
    Vfs(#[from] VfsError),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{reason}")]
    Other { kind: ErrorKind, reason: String },
}

impl HandlerError {
    fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Vfs(err) => err.kind(),
            HandlerError::Meta(err) => err.kind(),
            HandlerError::Engine(err) => err.kind(),
            HandlerError::Message(err) => err.kind(),
            HandlerError::Encode(_) => ErrorKind::WriteFailed,
            HandlerError::Other { kind, .. } => *kind,
        }
    }

    fn other(kind: ErrorKind, reason: impl Into<String>) -> Self {
        HandlerError::Other {
            kind,
            reason: reason.into(),
        }
    }
}

type HandlerResult = Result<(String, Value), HandlerError>;

impl Handlers {
    /// Full inbound path for one message: validate, classify,
    /// dispatch, and shape the response.
    pub fn handle(&self, msg: Message, remote: SocketAddr) -> Message {
        if let Err(err) = msg.validate() {
            tracing::debug!(%remote, "rejecting message: {err}");
            return self.seal(Message::error_response(
                &msg.action,
                err.kind(),
                &err,
                &self.node_id,
            ));
        }

        let result = match msg.classify() {
            Ok(Kind::Command(action)) => self.handle_command(action, &msg),
            Ok(Kind::Sync(action)) => self.handle_sync(action, &msg),
            Ok(Kind::Heartbeat(_)) => return self.handle_ping(&msg, remote),
            Ok(Kind::Discovery(_)) => Err(HandlerError::other(
                ErrorKind::Protocol,
                "discovery messages are UDP-only",
            )),
            Ok(Kind::Response) => Err(HandlerError::other(
                ErrorKind::Protocol,
                "unexpected response message",
            )),
            Err(err) => Err(err.into()),
        };

        let response = match result {
            Ok((text, data)) => Message::response(&msg.action, true, text, data, &self.node_id),
            Err(err) => {
                tracing::debug!(%remote, action = %msg.action, "request failed: {err}");
                Message::error_response(&msg.action, err.kind(), &err, &self.node_id)
            }
        };
        self.seal(response)
    }

    fn seal(&self, msg: Message) -> Message {
        match msg.clone().seal() {
            Ok(sealed) => sealed,
            Err(err) => {
                tracing::error!("response seal failed: {err}");
                msg
            }
        }
    }

    fn handle_command(&self, action: CommandAction, msg: &Message) -> HandlerResult {
        match action {
            CommandAction::Create => self.cmd_create(msg),
            CommandAction::Write => self.cmd_write(msg),
            CommandAction::Read => self.cmd_read(msg),
            CommandAction::Delete => self.cmd_delete(msg),
            CommandAction::Mkdir => self.cmd_mkdir(msg),
            CommandAction::List => self.cmd_list(msg),
            CommandAction::History => self.cmd_history(msg),
        }
    }

    fn cmd_create(&self, msg: &Message) -> HandlerResult {
        let _commit = self.engine.lock_commit();
        self.vfs.create(&msg.path)?;
        let checksum = self.vfs.hash(&msg.path)?;
        let record = self.new_record(&msg.path, checksum, 0, Operation::Create)?;
        self.meta.upsert(&record)?;
        self.engine.enqueue_change(record, Some(Vec::new()));
        Ok(("file created".to_string(), Value::Null))
    }

    fn cmd_write(&self, msg: &Message) -> HandlerResult {
        let Value::String(encoded) = &msg.content else {
            return Err(HandlerError::other(
                ErrorKind::Protocol,
                "write content must be a base64 string",
            ));
        };
        let bytes = decode_body(encoded)?;

        let _commit = self.engine.lock_commit();
        let size = self.vfs.write(&msg.path, &bytes)?;
        let checksum = self.vfs.hash(&msg.path)?;
        let operation = match self.meta.get(&msg.path)? {
            Some(prior) if !prior.is_deleted => Operation::Modify,
            _ => Operation::Create,
        };
        let record = self.new_record(&msg.path, checksum, size, operation)?;
        self.meta.upsert(&record)?;
        self.engine.enqueue_change(record, Some(bytes));
        Ok((format!("wrote {size} bytes"), Value::Null))
    }

    fn cmd_read(&self, msg: &Message) -> HandlerResult {
        let record = self.meta.get(&msg.path)?;
        // A tombstone suppresses any body that may still be on disk.
        if record.as_ref().is_some_and(|r| r.is_deleted) {
            return Err(HandlerError::other(ErrorKind::NotFound, "no such file"));
        }
        let bytes = self.vfs.read(&msg.path)?;
        if self.verify_checksums
            && let Some(record) = &record
            && sha256_hex(&bytes) != record.checksum
        {
            return Err(HandlerError::other(
                ErrorKind::Integrity,
                "stored body does not match its recorded checksum",
            ));
        }
        Ok(("file read".to_string(), Value::String(encode_body(&bytes))))
    }

    fn cmd_delete(&self, msg: &Message) -> HandlerResult {
        let _commit = self.engine.lock_commit();
        let prior = self.meta.get(&msg.path)?;
        let existed = self.vfs.exists(&msg.path);
        self.vfs.delete(&msg.path)?;

        if prior.as_ref().is_some_and(|r| r.is_deleted) {
            return Ok(("already deleted".to_string(), Value::Null));
        }
        if prior.is_none() && !existed {
            return Ok(("nothing to delete".to_string(), Value::Null));
        }
        let mut record = self.new_record(&msg.path, String::new(), 0, Operation::Delete)?;
        record.is_deleted = true;
        self.meta.upsert(&record)?;
        self.engine.enqueue_change(record, None);
        Ok(("deleted".to_string(), Value::Null))
    }

    fn cmd_mkdir(&self, msg: &Message) -> HandlerResult {
        let _commit = self.engine.lock_commit();
        let prior = self.meta.get(&msg.path)?;
        self.vfs.mkdir(&msg.path)?;
        if prior
            .as_ref()
            .is_some_and(|r| !r.is_deleted && r.last_operation == Operation::Mkdir)
        {
            return Ok(("directory exists".to_string(), Value::Null));
        }
        let record = self.new_record(&msg.path, String::new(), 0, Operation::Mkdir)?;
        self.meta.upsert(&record)?;
        self.engine.enqueue_change(record, None);
        Ok(("directory created".to_string(), Value::Null))
    }

    fn cmd_list(&self, msg: &Message) -> HandlerResult {
        let items = self.vfs.list(&msg.path)?;
        Ok(("listed directory".to_string(), serde_json::to_value(items)?))
    }

    /// Operation audit trail; `scope: "sync"` selects the sync log
    /// instead of file operations.
    fn cmd_history(&self, msg: &Message) -> HandlerResult {
        let limit = msg
            .content
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(50) as usize;
        let data = match msg.content.get("scope").and_then(Value::as_str) {
            Some("sync") => serde_json::to_value(self.meta.sync_history(limit)?)?,
            _ => {
                let node = msg.content.get("node").and_then(Value::as_str);
                serde_json::to_value(self.meta.operation_history(limit, node)?)?
            }
        };
        Ok(("history retrieved".to_string(), data))
    }

    /// Builds the record for a just-committed local mutation; called
    /// with the commit lock held.
    fn new_record(
        &self,
        path: &str,
        checksum: String,
        size: u64,
        operation: Operation,
    ) -> Result<FileRecord, HandlerError> {
        let now = unix_now();
        let created_time = match self.meta.get(path)? {
            Some(prior) if !prior.is_deleted => prior.created_time,
            _ => now,
        };
        Ok(FileRecord {
            filepath: path.to_string(),
            checksum,
            size,
            version: self.meta.next_version(path)?,
            modified_time: now,
            created_time,
            origin: self.node_id.clone(),
            last_operation: operation,
            is_deleted: false,
        })
    }

    fn handle_sync(&self, action: SyncAction, msg: &Message) -> HandlerResult {
        match action {
            SyncAction::SyncFile => {
                let outcome = self.engine.apply_sync_file(msg)?;
                Ok((outcome.describe().to_string(), Value::Null))
            }
            SyncAction::SyncMetadata => {
                let theirs = MetadataSetPayload::from_content(&msg.content)?;
                let ours = self.engine.handle_metadata_set(&msg.origin, &theirs)?;
                Ok(("metadata exchanged".to_string(), serde_json::to_value(ours)?))
            }
            SyncAction::RequestFile => {
                let payload = self.engine.serve_file(&msg.path)?;
                Ok(("file served".to_string(), serde_json::to_value(payload)?))
            }
        }
    }

    /// Heartbeat ping: the stats snapshot tells us the sender's TCP
    /// port, which combined with the connection's source address is
    /// enough to register it.
    fn handle_ping(&self, msg: &Message, remote: SocketAddr) -> Message {
        if let Some(port) = msg.content.get("tcp_port").and_then(Value::as_u64) {
            let addr = SocketAddr::new(remote.ip(), port as u16);
            self.registry
                .observe(&msg.origin, addr, None, Some(msg.content.clone()));
        }
        self.seal(Message::response(
            "pong",
            true,
            "alive",
            (self.stats)(),
            &self.node_id,
        ))
    }
}
