//! Metadata store: versioned file records and the sync audit log.
//!
//! One SQLite database per node, living at the root of the replicated
//! namespace. All access goes through a single `Mutex<Connection>`,
//! which is the in-process writer lock that subsumes SQLite's own
//! locking; WAL mode keeps reopen-after-crash free of partial records.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::proto::message::unix_now;

const BUSY_TIMEOUT_MS: u64 = 5_000;
const RECENT_SYNC_WINDOW_SECS: f64 = 3_600.0;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filepath TEXT UNIQUE NOT NULL,
    checksum TEXT NOT NULL,
    size INTEGER NOT NULL,
    version INTEGER NOT NULL,
    modified_time REAL NOT NULL,
    created_time REAL NOT NULL,
    origin TEXT NOT NULL,
    last_operation TEXT NOT NULL,
    is_deleted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_files_filepath ON files(filepath);
CREATE TABLE IF NOT EXISTS sync_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sync_id TEXT NOT NULL,
    source_node TEXT NOT NULL,
    target_node TEXT NOT NULL,
    filepath TEXT NOT NULL,
    action TEXT NOT NULL,
    timestamp REAL NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_sync_log_timestamp ON sync_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_sync_log_sync_id ON sync_log(sync_id);
";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Modify,
    Delete,
    Mkdir,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Modify => "modify",
            Operation::Delete => "delete",
            Operation::Mkdir => "mkdir",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Operation::Create),
            "modify" => Some(Operation::Modify),
            "delete" => Some(Operation::Delete),
            "mkdir" => Some(Operation::Mkdir),
            _ => None,
        }
    }
}

/// One row of the `files` table. Tombstones (`is_deleted`) stay in the
/// table forever; `version` keeps climbing across them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filepath: String,
    pub checksum: String,
    pub size: u64,
    pub version: u64,
    pub modified_time: f64,
    pub created_time: f64,
    pub origin: String,
    pub last_operation: Operation,
    pub is_deleted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(SyncStatus::Pending),
            "success" => Some(SyncStatus::Success),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub sync_id: Uuid,
    pub source_node: String,
    pub target_node: String,
    pub filepath: String,
    pub action: String,
    pub timestamp: f64,
    pub status: SyncStatus,
    pub error_message: Option<String>,
}

impl SyncLogEntry {
    pub fn pending(
        source_node: impl Into<String>,
        target_node: impl Into<String>,
        filepath: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            sync_id: Uuid::new_v4(),
            source_node: source_node.into(),
            target_node: target_node.into(),
            filepath: filepath.into(),
            action: action.into(),
            timestamp: unix_now(),
            status: SyncStatus::Pending,
            error_message: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetaStats {
    pub active_files: u64,
    pub tombstones: u64,
    pub total_size: u64,
    pub recent_syncs: u64,
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stale version for {filepath}: existing {existing}, got {got}")]
    StaleVersion {
        filepath: String,
        existing: u64,
        got: u64,
    },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MetaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaError::StaleVersion { .. } => ErrorKind::Stale,
            MetaError::Sqlite(_) | MetaError::Io { .. } => ErrorKind::WriteFailed,
        }
    }
}

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    pub fn open(db_path: &Path) -> Result<Self, MetaError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| MetaError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch("PRAGMA synchronous=NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(db = %db_path.display(), "metadata store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, MetaError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert-or-replace keyed by filepath. Rejects any write whose
    /// version is not strictly greater than the stored one, including
    /// the tombstone's.
    pub fn upsert(&self, record: &FileRecord) -> Result<(), MetaError> {
        let mut conn = self.conn.lock().expect("metadata lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<u64> = tx
            .query_row(
                "SELECT version FROM files WHERE filepath = ?1",
                params![record.filepath],
                |row| row.get::<_, i64>(0).map(|v| v as u64),
            )
            .optional()?;
        if let Some(existing) = existing
            && record.version <= existing
        {
            return Err(MetaError::StaleVersion {
                filepath: record.filepath.clone(),
                existing,
                got: record.version,
            });
        }
        tx.execute(
            "INSERT INTO files \
             (filepath, checksum, size, version, modified_time, created_time, origin, last_operation, is_deleted) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(filepath) DO UPDATE SET \
             checksum = excluded.checksum, size = excluded.size, version = excluded.version, \
             modified_time = excluded.modified_time, origin = excluded.origin, \
             last_operation = excluded.last_operation, is_deleted = excluded.is_deleted",
            params![
                record.filepath,
                record.checksum,
                record.size as i64,
                record.version as i64,
                record.modified_time,
                record.created_time,
                record.origin,
                record.last_operation.as_str(),
                record.is_deleted as i64,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Returns the record for a path, tombstone or not.
    pub fn get(&self, filepath: &str) -> Result<Option<FileRecord>, MetaError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let record = conn
            .query_row(
                "SELECT filepath, checksum, size, version, modified_time, created_time, \
                 origin, last_operation, is_deleted FROM files WHERE filepath = ?1",
                params![filepath],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn all_active(&self) -> Result<Vec<FileRecord>, MetaError> {
        self.select_records("WHERE is_deleted = 0")
    }

    /// Every record, tombstones included; this is what reconciliation
    /// exchanges.
    pub fn all_records(&self) -> Result<Vec<FileRecord>, MetaError> {
        self.select_records("")
    }

    fn select_records(&self, filter: &str) -> Result<Vec<FileRecord>, MetaError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let sql = format!(
            "SELECT filepath, checksum, size, version, modified_time, created_time, \
             origin, last_operation, is_deleted FROM files {filter} ORDER BY filepath"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn next_version(&self, filepath: &str) -> Result<u64, MetaError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let existing: Option<u64> = conn
            .query_row(
                "SELECT version FROM files WHERE filepath = ?1",
                params![filepath],
                |row| row.get::<_, i64>(0).map(|v| v as u64),
            )
            .optional()?;
        Ok(existing.map_or(1, |v| v + 1))
    }

    pub fn append_sync(&self, entry: &SyncLogEntry) -> Result<(), MetaError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.execute(
            "INSERT INTO sync_log \
             (sync_id, source_node, target_node, filepath, action, timestamp, status, error_message) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.sync_id.to_string(),
                entry.source_node,
                entry.target_node,
                entry.filepath,
                entry.action,
                entry.timestamp,
                entry.status.as_str(),
                entry.error_message,
            ],
        )?;
        Ok(())
    }

    /// pending -> success | failed. A second resolution is a no-op.
    pub fn resolve_sync(
        &self,
        sync_id: Uuid,
        status: SyncStatus,
        error: Option<&str>,
    ) -> Result<(), MetaError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.execute(
            "UPDATE sync_log SET status = ?1, error_message = ?2 \
             WHERE sync_id = ?3 AND status = 'pending'",
            params![status.as_str(), error, sync_id.to_string()],
        )?;
        Ok(())
    }

    /// Resolves every pending entry older than the cutoff to failed.
    /// Returns how many were touched.
    pub fn fail_stale_pending(&self, older_than: f64) -> Result<usize, MetaError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let n = conn.execute(
            "UPDATE sync_log SET status = 'failed', error_message = 'retry horizon exceeded' \
             WHERE status = 'pending' AND timestamp < ?1",
            params![older_than],
        )?;
        Ok(n)
    }

    pub fn sync_history(&self, limit: usize) -> Result<Vec<SyncLogEntry>, MetaError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT sync_id, source_node, target_node, filepath, action, timestamp, status, error_message \
             FROM sync_log ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_sync_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Recent file operations, newest first, optionally filtered to one
    /// originating node.
    pub fn operation_history(
        &self,
        limit: usize,
        node: Option<&str>,
    ) -> Result<Vec<FileRecord>, MetaError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let sql = match node {
            Some(_) => {
                "SELECT filepath, checksum, size, version, modified_time, created_time, \
                 origin, last_operation, is_deleted FROM files \
                 WHERE origin = ?1 ORDER BY modified_time DESC LIMIT ?2"
            }
            None => {
                "SELECT filepath, checksum, size, version, modified_time, created_time, \
                 origin, last_operation, is_deleted FROM files \
                 ORDER BY modified_time DESC LIMIT ?1"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let mut records = Vec::new();
        match node {
            Some(node) => {
                let rows = stmt.query_map(params![node, limit as i64], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let rows = stmt.query_map(params![limit as i64], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }
        Ok(records)
    }

    pub fn stats(&self) -> Result<MetaStats, MetaError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let (active_files, total_size): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM files WHERE is_deleted = 0",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let tombstones: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE is_deleted = 1",
            [],
            |row| row.get(0),
        )?;
        let recent_syncs: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_log WHERE timestamp > ?1",
            params![unix_now() - RECENT_SYNC_WINDOW_SECS],
            |row| row.get(0),
        )?;
        Ok(MetaStats {
            active_files: active_files as u64,
            tombstones: tombstones as u64,
            total_size: total_size as u64,
            recent_syncs: recent_syncs as u64,
        })
    }

    pub fn vacuum(&self) -> Result<(), MetaError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.execute_batch("VACUUM")?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let operation: String = row.get(7)?;
    let last_operation = Operation::parse(&operation).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            Type::Text,
            format!("unknown operation {operation:?}").into(),
        )
    })?;
    Ok(FileRecord {
        filepath: row.get(0)?,
        checksum: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        version: row.get::<_, i64>(3)? as u64,
        modified_time: row.get(4)?,
        created_time: row.get(5)?,
        origin: row.get(6)?,
        last_operation,
        is_deleted: row.get::<_, i64>(8)? != 0,
    })
}

fn row_to_sync_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncLogEntry> {
    let raw_id: String = row.get(0)?;
    let sync_id = Uuid::parse_str(&raw_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
    })?;
    let raw_status: String = row.get(6)?;
    let status = SyncStatus::parse(&raw_status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            Type::Text,
            format!("unknown sync status {raw_status:?}").into(),
        )
    })?;
    Ok(SyncLogEntry {
        sync_id,
        source_node: row.get(1)?,
        target_node: row.get(2)?,
        filepath: row.get(3)?,
        action: row.get(4)?,
        timestamp: row.get(5)?,
        status,
        error_message: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, version: u64) -> FileRecord {
        FileRecord {
            filepath: path.to_string(),
            checksum: "ck".to_string(),
            size: 5,
            version,
            modified_time: 100.0,
            created_time: 100.0,
            origin: "node-a".to_string(),
            last_operation: Operation::Create,
            is_deleted: false,
        }
    }

    #[test]
    fn upsert_then_get_roundtrips() {
        let store = MetadataStore::open_in_memory().unwrap();
        let rec = record("a.txt", 1);
        store.upsert(&rec).unwrap();
        assert_eq!(store.get("a.txt").unwrap().unwrap(), rec);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn upsert_rejects_non_increasing_versions() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert(&record("a.txt", 2)).unwrap();
        for stale in [1, 2] {
            let err = store.upsert(&record("a.txt", stale)).unwrap_err();
            assert!(matches!(err, MetaError::StaleVersion { existing: 2, .. }));
            assert_eq!(err.kind(), ErrorKind::Stale);
        }
        store.upsert(&record("a.txt", 3)).unwrap();
    }

    #[test]
    fn next_version_counts_tombstones() {
        let store = MetadataStore::open_in_memory().unwrap();
        assert_eq!(store.next_version("a.txt").unwrap(), 1);
        store.upsert(&record("a.txt", 1)).unwrap();
        let mut tombstone = record("a.txt", 2);
        tombstone.is_deleted = true;
        tombstone.last_operation = Operation::Delete;
        store.upsert(&tombstone).unwrap();
        // A re-created file continues the sequence.
        assert_eq!(store.next_version("a.txt").unwrap(), 3);
    }

    #[test]
    fn active_scan_hides_tombstones_but_full_scan_keeps_them() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert(&record("kept.txt", 1)).unwrap();
        let mut gone = record("gone.txt", 1);
        gone.is_deleted = true;
        store.upsert(&gone).unwrap();

        let active = store.all_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].filepath, "kept.txt");

        let all = store.all_records().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn sync_log_resolution_is_single_shot() {
        let store = MetadataStore::open_in_memory().unwrap();
        let entry = SyncLogEntry::pending("node-a", "node-b", "a.txt", "sync_file");
        store.append_sync(&entry).unwrap();

        store
            .resolve_sync(entry.sync_id, SyncStatus::Success, None)
            .unwrap();
        // Late failure report must not overwrite the resolved status.
        store
            .resolve_sync(entry.sync_id, SyncStatus::Failed, Some("late"))
            .unwrap();

        let history = store.sync_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, SyncStatus::Success);
        assert_eq!(history[0].error_message, None);
    }

    #[test]
    fn stale_pending_entries_get_failed() {
        let store = MetadataStore::open_in_memory().unwrap();
        let mut old = SyncLogEntry::pending("node-a", "node-b", "a.txt", "sync_file");
        old.timestamp = 10.0;
        store.append_sync(&old).unwrap();
        let fresh = SyncLogEntry::pending("node-a", "node-b", "b.txt", "sync_file");
        store.append_sync(&fresh).unwrap();

        assert_eq!(store.fail_stale_pending(unix_now() - 60.0).unwrap(), 1);
        let history = store.sync_history(10).unwrap();
        let old_row = history.iter().find(|e| e.sync_id == old.sync_id).unwrap();
        assert_eq!(old_row.status, SyncStatus::Failed);
        let fresh_row = history.iter().find(|e| e.sync_id == fresh.sync_id).unwrap();
        assert_eq!(fresh_row.status, SyncStatus::Pending);
    }

    #[test]
    fn stats_count_by_state() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert(&record("a.txt", 1)).unwrap();
        let mut dead = record("b.txt", 1);
        dead.is_deleted = true;
        store.upsert(&dead).unwrap();
        store
            .append_sync(&SyncLogEntry::pending("a", "b", "a.txt", "sync_file"))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.active_files, 1);
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.total_size, 5);
        assert_eq!(stats.recent_syncs, 1);
    }

    #[test]
    fn operation_history_filters_by_node() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert(&record("a.txt", 1)).unwrap();
        let mut other = record("b.txt", 1);
        other.origin = "node-b".to_string();
        store.upsert(&other).unwrap();

        assert_eq!(store.operation_history(10, None).unwrap().len(), 2);
        let only_b = store.operation_history(10, Some("node-b")).unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].filepath, "b.txt");
    }

    #[test]
    fn reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("metadata.db");
        {
            let store = MetadataStore::open(&db).unwrap();
            store.upsert(&record("a.txt", 4)).unwrap();
        }
        let store = MetadataStore::open(&db).unwrap();
        assert_eq!(store.get("a.txt").unwrap().unwrap().version, 4);
        assert_eq!(store.next_version("a.txt").unwrap(), 5);
    }
}
