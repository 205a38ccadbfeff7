//! Framed request/response protocol: wire framing, message schema, and
//! the one-shot TCP client used for peer traffic.

pub mod client;
pub mod frame;
pub mod message;

pub use client::{Client, ClientError};
pub use frame::{FrameError, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_BYTES};
pub use message::{
    CommandAction, DiscoveryAction, DiscoveryPayload, HeartbeatAction, Kind, Message,
    MessageError, MetadataSetPayload, RecordSummary, ResponsePayload, SyncAction, SyncFilePayload,
    SyncMeta,
};
