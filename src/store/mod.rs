//! Local byte store and versioned metadata store.

pub mod meta;
pub mod vfs;

pub use meta::{FileRecord, MetaError, MetaStats, MetadataStore, Operation, SyncLogEntry, SyncStatus};
pub use vfs::{DirEntryInfo, EntryKind, LocalStore, StoreStats, VfsError};
