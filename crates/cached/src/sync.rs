//! Full-state anti-entropy exchanged when a node joins

use crate::store::Store;
use clap::ValueEnum;
use gossip_cache_core::codec;
use gossip_cache_core::types::*;
use thiserror::Error;
use tracing::{debug, warn};

/// Sync errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to encode snapshot: {0}")]
    Encode(gossip_cache_core::Error),
    #[error("Malformed snapshot: {0}")]
    Malformed(gossip_cache_core::Error),
}

/// Resolution for ids present on both sides with different entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MergePolicy {
    /// The remote entry overwrites the local one
    #[default]
    RemoteWins,
    /// The local entry is kept; only absent ids are taken
    KeepLocal,
}

/// What a merge did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Ids that were absent locally
    pub inserted: usize,
    /// Local entries overwritten by a differing remote entry
    pub replaced: usize,
    /// Ids whose local and remote entries differed
    pub conflicts: usize,
    /// Entries refused because their source was collected
    pub skipped: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.replaced > 0
    }
}

/// Every local entry, for transfer to a peer
pub fn snapshot_for_transfer(store: &Store) -> Vec<CacheEntry> {
    store.entries().cloned().collect()
}

/// Encoded full-state snapshot
pub fn encode_snapshot(store: &Store) -> Result<Vec<u8>, SyncError> {
    codec::encode_state(&snapshot_for_transfer(store)).map_err(SyncError::Encode)
}

/// Decode a peer's snapshot
pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<CacheEntry>, SyncError> {
    codec::decode_state(bytes).map_err(SyncError::Malformed)
}

/// Merge a remote snapshot into the local store.
///
/// Only a merge that is part of a join mutates anything. Entries for which
/// `is_refused(source_node, source_incarnation)` holds are dropped. Ids
/// present only locally are never touched.
pub fn merge_on_join(
    store: &mut Store,
    remote: Vec<CacheEntry>,
    join: bool,
    policy: MergePolicy,
    is_refused: impl Fn(&str, u64) -> bool,
) -> MergeReport {
    let mut report = MergeReport::default();
    if !join {
        debug!("Ignoring {} pushed entries outside of a join", remote.len());
        return report;
    }

    for entry in remote {
        if is_refused(&entry.source_node, entry.source_incarnation) {
            report.skipped += 1;
            continue;
        }

        let id = entry.id();
        let differs = match store.get(id) {
            None => {
                report.inserted += 1;
                store.replace_entry(id, entry);
                continue;
            }
            Some(local) => *local != entry,
        };

        if differs {
            report.conflicts += 1;
            let local = store.get(id).map(|e| e.source_node.clone()).unwrap_or_default();
            match policy {
                MergePolicy::RemoteWins => {
                    warn!(
                        "Join merge replaced record {} from {} with the copy from {}",
                        id, local, entry.source_node
                    );
                    report.replaced += 1;
                    store.replace_entry(id, entry);
                }
                MergePolicy::KeepLocal => {
                    warn!(
                        "Join merge kept record {} from {} over the copy from {}",
                        id, local, entry.source_node
                    );
                }
            }
        } else if policy == MergePolicy::RemoteWins {
            store.replace_entry(id, entry);
        }
    }

    report
}
