//! Message schema, integrity checksum, and (type, action) classification.
//!
//! Every unit of traffic — client command, peer sync, heartbeat,
//! discovery datagram, response — is one JSON object with the same
//! top-level fields. The checksum is SHA-256 over the object serialized
//! with sorted keys and the `checksum` field blanked, truncated to the
//! first 16 lowercase hex characters. It protects against accidental
//! corruption only; it is not authentication.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::store::meta::{FileRecord, Operation};

pub const CHECKSUM_HEX_LEN: usize = 16;
/// Messages whose timestamp is further than this from the local clock
/// are rejected as stale. Clocks are assumed loosely synchronized.
pub const TIMESTAMP_WINDOW_SECS: f64 = 300.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content: Value,
    pub origin: String,
    pub timestamp: f64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub sequence: u64,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("message decode failed: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("message checksum mismatch: expected {expected} got {got}")]
    ChecksumMismatch { expected: String, got: String },
    #[error("message timestamp {timestamp} outside window around {now}")]
    TimestampOutOfWindow { timestamp: f64, now: f64 },
    #[error("unknown message type/action: {kind}/{action}")]
    UnknownKind { kind: String, action: String },
    #[error("message origin is empty")]
    MissingOrigin,
    #[error("invalid {what} payload: {reason}")]
    InvalidPayload { what: &'static str, reason: String },
    #[error("body is not valid base64: {0}")]
    InvalidBody(#[from] base64::DecodeError),
}

impl MessageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessageError::ChecksumMismatch { .. } => ErrorKind::Integrity,
            MessageError::TimestampOutOfWindow { .. } => ErrorKind::Stale,
            _ => ErrorKind::Protocol,
        }
    }
}

/// Closed classification of (type, action) pairs. Anything outside this
/// table is a protocol error rather than being passed through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Command(CommandAction),
    Sync(SyncAction),
    Heartbeat(HeartbeatAction),
    Discovery(DiscoveryAction),
    Response,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandAction {
    Create,
    Read,
    Write,
    Delete,
    Mkdir,
    List,
    History,
}

impl CommandAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandAction::Create => "create",
            CommandAction::Read => "read",
            CommandAction::Write => "write",
            CommandAction::Delete => "delete",
            CommandAction::Mkdir => "mkdir",
            CommandAction::List => "list",
            CommandAction::History => "history",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(CommandAction::Create),
            "read" => Some(CommandAction::Read),
            "write" => Some(CommandAction::Write),
            "delete" => Some(CommandAction::Delete),
            "mkdir" => Some(CommandAction::Mkdir),
            "list" => Some(CommandAction::List),
            "history" => Some(CommandAction::History),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    SyncFile,
    SyncMetadata,
    RequestFile,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncAction::SyncFile => "sync_file",
            SyncAction::SyncMetadata => "sync_metadata",
            SyncAction::RequestFile => "request_file",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sync_file" => Some(SyncAction::SyncFile),
            "sync_metadata" => Some(SyncAction::SyncMetadata),
            "request_file" => Some(SyncAction::RequestFile),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatAction {
    Ping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryAction {
    Announce,
}

impl Kind {
    pub fn parse(kind: &str, action: &str) -> Option<Self> {
        match kind {
            "command" => CommandAction::parse(action).map(Kind::Command),
            "sync" => SyncAction::parse(action).map(Kind::Sync),
            "heartbeat" => (action == "ping").then_some(Kind::Heartbeat(HeartbeatAction::Ping)),
            "discovery" => {
                (action == "announce").then_some(Kind::Discovery(DiscoveryAction::Announce))
            }
            // Response actions mirror the request they answer.
            "response" => Some(Kind::Response),
            _ => None,
        }
    }
}

impl Message {
    fn base(kind: &str, action: &str, origin: &str) -> Self {
        Self {
            kind: kind.to_string(),
            action: action.to_string(),
            path: String::new(),
            content: Value::Null,
            origin: origin.to_string(),
            timestamp: unix_now(),
            checksum: String::new(),
            sequence: 0,
        }
    }

    pub fn command(action: CommandAction, path: &str, content: Value, origin: &str) -> Self {
        let mut msg = Self::base("command", action.as_str(), origin);
        msg.path = path.to_string();
        msg.content = content;
        msg
    }

    pub fn sync(action: SyncAction, path: &str, content: Value, origin: &str) -> Self {
        let mut msg = Self::base("sync", action.as_str(), origin);
        msg.path = path.to_string();
        msg.content = content;
        msg
    }

    pub fn heartbeat_ping(origin: &str, stats: Value) -> Self {
        let mut msg = Self::base("heartbeat", "ping", origin);
        msg.content = stats;
        msg
    }

    pub fn discovery_announce(origin: &str, port: u16) -> Self {
        let mut msg = Self::base("discovery", "announce", origin);
        msg.content = serde_json::json!(DiscoveryPayload {
            port,
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        msg
    }

    pub fn response(action: &str, success: bool, text: impl Into<String>, data: Value, origin: &str) -> Self {
        let mut msg = Self::base("response", action, origin);
        msg.content = serde_json::json!(ResponsePayload {
            success,
            message: text.into(),
            data,
        });
        msg
    }

    /// A failure response whose message leads with the wire kind code.
    pub fn error_response(
        action: &str,
        kind: ErrorKind,
        detail: impl std::fmt::Display,
        origin: &str,
    ) -> Self {
        Self::response(
            action,
            false,
            format!("{}: {}", kind.as_str(), detail),
            Value::Null,
            origin,
        )
    }

    /// Fills in the checksum field. Must be the last step before
    /// serialization; any later mutation invalidates it.
    pub fn seal(mut self) -> Result<Self, MessageError> {
        self.checksum = self.compute_checksum()?;
        Ok(self)
    }

    pub fn compute_checksum(&self) -> Result<String, MessageError> {
        let mut value = serde_json::to_value(self).map_err(MessageError::Encode)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("checksum".to_string(), Value::String(String::new()));
        }
        // serde_json maps are ordered, so `to_string` is the canonical
        // sorted-keys rendering.
        let canonical = value.to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(hex::encode(digest)[..CHECKSUM_HEX_LEN].to_string())
    }

    pub fn verify_checksum(&self) -> Result<(), MessageError> {
        let expected = self.compute_checksum()?;
        if self.checksum != expected {
            return Err(MessageError::ChecksumMismatch {
                expected,
                got: self.checksum.clone(),
            });
        }
        Ok(())
    }

    pub fn verify_timestamp(&self, now: f64) -> Result<(), MessageError> {
        if (self.timestamp - now).abs() > TIMESTAMP_WINDOW_SECS {
            return Err(MessageError::TimestampOutOfWindow {
                timestamp: self.timestamp,
                now,
            });
        }
        Ok(())
    }

    /// Checksum + timestamp + origin validation for inbound traffic.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.origin.is_empty() {
            return Err(MessageError::MissingOrigin);
        }
        self.verify_checksum()?;
        self.verify_timestamp(unix_now())
    }

    pub fn classify(&self) -> Result<Kind, MessageError> {
        Kind::parse(&self.kind, &self.action).ok_or_else(|| MessageError::UnknownKind {
            kind: self.kind.clone(),
            action: self.action.clone(),
        })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Decode)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Encode)
    }
}

/// `content` of `sync/sync_file` messages and of `request_file`
/// responses. `data` is the base64 body; deletes and mkdirs carry none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncFilePayload {
    #[serde(default)]
    pub data: Option<String>,
    pub metadata: SyncMeta,
}

/// Record fields carried alongside a synced body. `origin` is the node
/// that originated the mutation, which may differ from the message
/// sender when a record is relayed during reconciliation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub checksum: String,
    pub size: u64,
    pub operation: Operation,
    pub version: u64,
    pub modified_time: f64,
    pub created_time: f64,
    pub origin: String,
    #[serde(default)]
    pub is_deleted: bool,
}

impl SyncMeta {
    pub fn from_record(record: &FileRecord) -> Self {
        Self {
            checksum: record.checksum.clone(),
            size: record.size,
            operation: record.last_operation,
            version: record.version,
            modified_time: record.modified_time,
            created_time: record.created_time,
            origin: record.origin.clone(),
            is_deleted: record.is_deleted,
        }
    }
}

impl SyncFilePayload {
    pub fn from_record(record: &FileRecord, body: Option<&[u8]>) -> Self {
        Self {
            data: body.map(encode_body),
            metadata: SyncMeta::from_record(record),
        }
    }

    pub fn from_content(content: &Value) -> Result<Self, MessageError> {
        serde_json::from_value(content.clone()).map_err(|e| MessageError::InvalidPayload {
            what: "sync_file",
            reason: e.to_string(),
        })
    }
}

/// `content` of `sync/sync_metadata`: the full record set, tombstones
/// included — a cold node can only learn of deletions from them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSetPayload {
    pub records: BTreeMap<String, RecordSummary>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub version: u64,
    pub checksum: String,
    pub modified_time: f64,
    #[serde(default)]
    pub is_deleted: bool,
}

impl MetadataSetPayload {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a FileRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| {
                (
                    r.filepath.clone(),
                    RecordSummary {
                        version: r.version,
                        checksum: r.checksum.clone(),
                        modified_time: r.modified_time,
                        is_deleted: r.is_deleted,
                    },
                )
            })
            .collect();
        Self { records }
    }

    pub fn from_content(content: &Value) -> Result<Self, MessageError> {
        serde_json::from_value(content.clone()).map_err(|e| MessageError::InvalidPayload {
            what: "sync_metadata",
            reason: e.to_string(),
        })
    }
}

/// `content` of UDP `discovery/announce` datagrams.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub port: u16,
    pub version: String,
}

impl DiscoveryPayload {
    pub fn from_content(content: &Value) -> Result<Self, MessageError> {
        serde_json::from_value(content.clone()).map_err(|e| MessageError::InvalidPayload {
            what: "discovery",
            reason: e.to_string(),
        })
    }
}

/// `content` of every `response` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl ResponsePayload {
    pub fn from_content(content: &Value) -> Result<Self, MessageError> {
        serde_json::from_value(content.clone()).map_err(|e| MessageError::InvalidPayload {
            what: "response",
            reason: e.to_string(),
        })
    }
}

pub fn encode_body(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

pub fn decode_body(encoded: &str) -> Result<Vec<u8>, MessageError> {
    Ok(BASE64_STANDARD.decode(encoded)?)
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::command(
            CommandAction::Write,
            "docs/a.txt",
            Value::String(encode_body(b"hello")),
            "node-a",
        )
    }

    #[test]
    fn seal_then_verify_is_identity() {
        let msg = sample().seal().unwrap();
        msg.verify_checksum().unwrap();
        assert_eq!(msg.checksum.len(), CHECKSUM_HEX_LEN);
    }

    #[test]
    fn wire_roundtrip_preserves_checksum() {
        let msg = sample().seal().unwrap();
        let bytes = msg.to_bytes().unwrap();
        let parsed = Message::from_slice(&bytes).unwrap();
        assert_eq!(parsed, msg);
        parsed.verify_checksum().unwrap();
    }

    #[test]
    fn tampered_byte_flips_verification() {
        let msg = sample().seal().unwrap();
        let mut tampered = msg.clone();
        tampered.path.push('x');
        assert!(matches!(
            tampered.verify_checksum().unwrap_err(),
            MessageError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let mut msg = sample();
        msg.timestamp -= TIMESTAMP_WINDOW_SECS + 1.0;
        let msg = msg.seal().unwrap();
        let err = msg.verify_timestamp(unix_now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stale);
    }

    #[test]
    fn unknown_kind_is_a_protocol_error() {
        let mut msg = sample();
        msg.action = "format_disk".to_string();
        let err = msg.classify().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let mut msg = sample();
        msg.kind = "gossip".to_string();
        assert!(msg.classify().is_err());
    }

    #[test]
    fn known_pairs_classify() {
        assert_eq!(
            Kind::parse("command", "mkdir"),
            Some(Kind::Command(CommandAction::Mkdir))
        );
        assert_eq!(
            Kind::parse("sync", "request_file"),
            Some(Kind::Sync(SyncAction::RequestFile))
        );
        assert_eq!(
            Kind::parse("heartbeat", "ping"),
            Some(Kind::Heartbeat(HeartbeatAction::Ping))
        );
        assert_eq!(
            Kind::parse("discovery", "announce"),
            Some(Kind::Discovery(DiscoveryAction::Announce))
        );
        assert_eq!(Kind::parse("response", "pong"), Some(Kind::Response));
    }

    #[test]
    fn body_roundtrip() {
        let body = b"\x00\x01binary\xff";
        let encoded = encode_body(body);
        assert_eq!(decode_body(&encoded).unwrap(), body);
        assert!(decode_body("not//valid**").is_err());
    }

    #[test]
    fn error_response_leads_with_kind_code() {
        let msg = Message::error_response("read", ErrorKind::NotFound, "no such file", "node-a");
        let payload = ResponsePayload::from_content(&msg.content).unwrap();
        assert!(!payload.success);
        assert!(payload.message.starts_with("not_found:"));
    }
}
