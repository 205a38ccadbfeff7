//! Replication: local-change fan-out, inbound application with
//! conflict resolution, and reconnect-time reconciliation.

pub mod engine;
pub mod reconcile;

pub use engine::{ApplyOutcome, ChangeEvent, EngineConfig, EngineError, EngineHandle, SyncEngine};
