//! Reconnect-time reconciliation: full metadata exchange plus pulls.
//!
//! When a peer comes up, both sides end holding the other's record set
//! (tombstones included): the initiator reads it from the response, the
//! responder from the request. Each side then pulls, via
//! `request_file`, whatever the other holds at a strictly higher
//! version or that it lacks entirely.

use std::net::SocketAddr;

use serde_json::Value;

use crate::proto::message::{Message, MetadataSetPayload, SyncAction, SyncFilePayload};
use crate::sync::engine::{EngineError, SyncEngine};

/// Paths where `theirs` is strictly newer than `ours`, or unknown to
/// us. Equal versions are left alone: push-time conflict resolution
/// already arbitrated them, and the winner carries a higher version.
pub(crate) fn diff_wanted(ours: &MetadataSetPayload, theirs: &MetadataSetPayload) -> Vec<String> {
    theirs
        .records
        .iter()
        .filter(|(path, their)| match ours.records.get(*path) {
            None => true,
            Some(our) => their.version > our.version,
        })
        .map(|(path, _)| path.clone())
        .collect()
}

/// One full reconciliation round against a peer. Returns how many
/// records were pulled and applied.
pub(crate) fn reconcile_with_peer(
    engine: &SyncEngine,
    peer_id: &str,
    addr: SocketAddr,
) -> Result<usize, EngineError> {
    let ours = MetadataSetPayload::from_records(engine.meta.all_records()?.iter());
    let content = serde_json::to_value(&ours).map_err(EngineError::Encode)?;
    let msg = Message::sync(SyncAction::SyncMetadata, "", content, &engine.config.node_id)
        .seal()?;

    let (_, payload) = engine.config.client.call_expect(addr, &msg)?;
    if !payload.success {
        return Err(EngineError::PeerRejected {
            peer: peer_id.to_string(),
            what: "sync_metadata",
            reason: payload.message,
        });
    }
    let theirs = MetadataSetPayload::from_content(&payload.data)?;

    let wants = diff_wanted(&ours, &theirs);
    tracing::debug!(
        peer = peer_id,
        ours = ours.records.len(),
        theirs = theirs.records.len(),
        wants = wants.len(),
        "metadata sets exchanged"
    );
    pull_files(engine, peer_id, addr, &wants)
}

/// Pulls the named paths from a peer in `batch_size` groups, applying
/// each through the normal inbound path. Individual failures are
/// logged and skipped; the next reconciliation retries them.
pub(crate) fn pull_files(
    engine: &SyncEngine,
    peer_id: &str,
    addr: SocketAddr,
    paths: &[String],
) -> Result<usize, EngineError> {
    let mut applied = 0usize;
    for batch in paths.chunks(engine.config.batch_size.max(1)) {
        for path in batch {
            match pull_one(engine, addr, path) {
                Ok(()) => applied += 1,
                Err(err) => {
                    tracing::warn!(peer = peer_id, path, "pull failed: {err}");
                }
            }
        }
    }
    Ok(applied)
}

fn pull_one(engine: &SyncEngine, addr: SocketAddr, path: &str) -> Result<(), EngineError> {
    let msg = Message::sync(
        SyncAction::RequestFile,
        path,
        Value::Null,
        &engine.config.node_id,
    )
    .seal()?;
    let (response, payload) = engine.config.client.call_expect(addr, &msg)?;
    if !payload.success {
        return Err(EngineError::PeerRejected {
            peer: response.origin,
            what: "request_file",
            reason: payload.message,
        });
    }
    let file = SyncFilePayload::from_content(&payload.data)?;
    engine.apply_payload(path, &file, &response.origin)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::message::RecordSummary;
    use std::collections::BTreeMap;

    fn summary(version: u64) -> RecordSummary {
        RecordSummary {
            version,
            checksum: "ck".to_string(),
            modified_time: 1.0,
            is_deleted: false,
        }
    }

    fn set(entries: &[(&str, u64)]) -> MetadataSetPayload {
        let records: BTreeMap<String, RecordSummary> = entries
            .iter()
            .map(|(path, version)| (path.to_string(), summary(*version)))
            .collect();
        MetadataSetPayload { records }
    }

    #[test]
    fn wants_missing_and_strictly_newer_paths() {
        let ours = set(&[("same.txt", 2), ("stale.txt", 1), ("ahead.txt", 5)]);
        let theirs = set(&[
            ("same.txt", 2),
            ("stale.txt", 3),
            ("ahead.txt", 1),
            ("new.txt", 1),
        ]);
        let mut wants = diff_wanted(&ours, &theirs);
        wants.sort();
        assert_eq!(wants, vec!["new.txt", "stale.txt"]);
    }

    #[test]
    fn empty_sets_want_nothing() {
        assert!(diff_wanted(&set(&[]), &set(&[])).is_empty());
        assert!(diff_wanted(&set(&[("a", 1)]), &set(&[])).is_empty());
    }
}
