//! Hooks through which an application plugs into the cluster

use crate::peer::NodeInfo;
use thiserror::Error;

/// Errors a delegate reports back to the substrate.
///
/// Any delegate error stops the cluster; delegates that want to tolerate bad
/// input must swallow it themselves.
#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("state encoding failed: {0}")]
    Encoding(String),
}

/// Application data hooks
pub trait Delegate: Send + Sync {
    /// Metadata advertised for the local node, at most `limit` bytes
    fn node_metadata(&self, limit: usize) -> Vec<u8>;

    /// A user message piggybacked on gossip from a peer
    fn handle_incoming_message(&self, message: &[u8]) -> Result<(), DelegateError>;

    /// Messages to piggyback on the next outgoing packet.
    ///
    /// Each message costs `overhead` bytes on top of its length; the total
    /// must not exceed `limit`.
    fn pending_outgoing_messages(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local state sent during a state exchange
    fn snapshot_state(&self, for_join: bool) -> Result<Vec<u8>, DelegateError>;

    /// Merge a peer's state from a state exchange
    fn merge_state(&self, state: &[u8], for_join: bool) -> Result<(), DelegateError>;
}

/// Membership change notifications
pub trait EventDelegate: Send + Sync {
    fn on_join(&self, node: &NodeInfo);
    fn on_leave(&self, node: &NodeInfo);
    fn on_state_change(&self, node: &NodeInfo);
}
