//! In-memory record store

use gossip_cache_core::codec;
use gossip_cache_core::types::*;
use std::collections::HashMap;

/// Result of a conditional insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Authoritative map of records and their origin.
///
/// Has no locking of its own; the owning node serializes access.
#[derive(Debug, Default)]
pub struct Store {
    entries: HashMap<i64, CacheEntry>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert only if the id is absent
    pub fn try_insert(
        &mut self,
        record: Record,
        source_node: &str,
        source_incarnation: u64,
    ) -> InsertOutcome {
        match self.entries.entry(record.id) {
            std::collections::hash_map::Entry::Occupied(_) => InsertOutcome::AlreadyExists,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(CacheEntry::new(record, source_node, source_incarnation));
                InsertOutcome::Inserted
            }
        }
    }

    /// All records, unordered
    pub fn list(&self) -> Vec<Record> {
        self.entries.values().map(|e| e.record.clone()).collect()
    }

    /// Delete every entry sourced by `node`, returning how many went
    pub fn remove_by_source(&mut self, node: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.source_node != node);
        before - self.entries.len()
    }

    /// Unconditional overwrite, for join merges only
    pub fn replace_entry(&mut self, id: i64, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(id, entry)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: i64) -> Option<&CacheEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Order-independent digest of every entry
    pub fn digest(&self) -> gossip_cache_core::Result<[u8; 32]> {
        codec::digest_entries(self.entries.values())
    }
}
