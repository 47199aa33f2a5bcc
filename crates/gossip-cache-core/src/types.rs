//! Core record types for gossip-cache
//!
//! Field order matters: inter-node messages are postcard-encoded in struct
//! field order.

use serde::{Deserialize, Serialize};

/// Cluster member name as assigned by the membership layer.
pub type NodeName = String;

/// Client-visible record. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Record {
    /// Cluster-wide unique, caller-assigned identifier
    pub id: i64,
    pub name: String,
}

impl Record {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A stored record together with the node that first accepted it.
///
/// `source_node` and `source_incarnation` only scope garbage collection and
/// never reach clients.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub record: Record,
    pub source_node: NodeName,
    /// Life of the source node that accepted the record
    pub source_incarnation: u64,
}

impl CacheEntry {
    pub fn new(record: Record, source_node: impl Into<NodeName>, source_incarnation: u64) -> Self {
        Self {
            record,
            source_node: source_node.into(),
            source_incarnation,
        }
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }
}

/// Kind of mutation carried by a broadcast
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Create,
}

/// One-shot dissemination message
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Broadcast {
    pub record: Record,
    /// Node that originally accepted the record
    pub node: NodeName,
    /// Life of `node` in which it accepted the record
    pub incarnation: u64,
    pub action: Action,
}

impl Broadcast {
    /// Creation event for a record accepted by `node` during `incarnation`
    pub fn create(record: Record, node: impl Into<NodeName>, incarnation: u64) -> Self {
        Self {
            record,
            node: node.into(),
            incarnation,
            action: Action::Create,
        }
    }

    /// Queue key; two broadcasts with the same key describe the same id.
    pub fn key(&self) -> String {
        match self.action {
            Action::Create => format!("create:{}", self.record.id),
        }
    }
}
