//! Creation broadcasts piggybacked on gossip

use crate::store::{InsertOutcome, Store};
use gossip_cache_core::codec;
use gossip_cache_core::types::*;
use gossip_cache_net::{BroadcastPolicy, MemberCount, TransmitLimitedQueue};
use thiserror::Error;

/// Broadcast errors
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Failed to encode broadcast: {0}")]
    Encode(gossip_cache_core::Error),
    #[error("Malformed broadcast: {0}")]
    Malformed(gossip_cache_core::Error),
}

/// Outgoing side of dissemination: a transmit-limited queue of encoded
/// creation events. Messages are never coalesced unless the policy asks.
#[derive(Debug)]
pub struct Disseminator {
    queue: TransmitLimitedQueue,
}

impl Disseminator {
    pub fn new(policy: BroadcastPolicy, members: MemberCount) -> Self {
        Self {
            queue: TransmitLimitedQueue::new(policy, members),
        }
    }

    /// Schedule a creation event for `record`, accepted by `origin` during
    /// its life `incarnation`.
    ///
    /// The queue is untouched if encoding fails.
    pub fn enqueue(
        &mut self,
        record: &Record,
        origin: &str,
        incarnation: u64,
    ) -> Result<(), BroadcastError> {
        let broadcast = Broadcast::create(record.clone(), origin, incarnation);
        let payload = codec::encode_broadcast(&broadcast).map_err(BroadcastError::Encode)?;
        self.queue.queue(Some(broadcast.key()), payload);
        Ok(())
    }

    /// Re-queue a message received from a peer, byte for byte
    pub fn relay(&mut self, broadcast: &Broadcast, payload: Vec<u8>) {
        self.queue.queue(Some(broadcast.key()), payload);
    }

    /// Messages for one outgoing packet
    pub fn drain(&mut self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.queue.get_broadcasts(overhead, limit)
    }

    /// Messages still within their retransmit budget
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Decode a message received from a peer
pub fn decode(message: &[u8]) -> Result<Broadcast, BroadcastError> {
    codec::decode_broadcast(message).map_err(BroadcastError::Malformed)
}

/// Apply a decoded creation event; the embedded node becomes the source.
pub fn apply(store: &mut Store, broadcast: Broadcast) -> InsertOutcome {
    match broadcast.action {
        Action::Create => {
            store.try_insert(broadcast.record, &broadcast.node, broadcast.incarnation)
        }
    }
}
