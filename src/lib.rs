#![forbid(unsafe_code)]

//! meshfs: a peer-to-peer replicated file service for trusted LANs.
//!
//! Every node runs the same daemon: a framed TCP protocol serves local
//! clients and peers alike, UDP broadcast discovers peers, heartbeats
//! track liveness, and a replication engine pushes local mutations to
//! every alive peer and reconciles divergence on reconnect with
//! deterministic last-writer-wins.

pub mod config;
pub mod daemon;
pub mod error;
pub mod peer;
pub mod proto;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use error::{Error, ErrorKind};
pub type Result<T> = std::result::Result<T, Error>;

pub use config::Config;
pub use daemon::{NodeDaemon, NodeHandle};
pub use store::meta::{FileRecord, Operation};
