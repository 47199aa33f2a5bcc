//! Node identity and membership counting

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Information about a cluster member
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique member name
    pub name: String,
    /// Gossip address
    pub addr: SocketAddr,
    /// Start time of this life of the node (unix millis)
    pub incarnation: u64,
}

impl NodeInfo {
    /// Create node info for a node starting now
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self::with_incarnation(name, addr, fresh_incarnation())
    }

    pub fn with_incarnation(name: impl Into<String>, addr: SocketAddr, incarnation: u64) -> Self {
        Self {
            name: name.into(),
            addr,
            incarnation,
        }
    }

    /// Whether `other` describes a newer life or a moved address of this node
    pub fn is_superseded_by(&self, other: &NodeInfo) -> bool {
        other.incarnation > self.incarnation
            || (other.incarnation == self.incarnation && other.addr != self.addr)
    }
}

impl std::fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

/// Incarnation for a node life starting now
pub fn fresh_incarnation() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared live-member count, including the local node.
///
/// Cloned into the broadcast queue so retransmit limits follow cluster size
/// without the queue holding a reference to the cluster.
#[derive(Clone, Debug)]
pub struct MemberCount(Arc<AtomicUsize>);

impl MemberCount {
    /// A count for a cluster of just the local node
    pub fn new() -> Self {
        Self(Arc::new(AtomicUsize::new(1)))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, members: usize) {
        self.0.store(members.max(1), Ordering::Relaxed);
    }
}

impl Default for MemberCount {
    fn default() -> Self {
        Self::new()
    }
}
