//! Retransmit-limited broadcast queue
//!
//! Messages are handed out fewest-transmits-first (newest first among equals)
//! and dropped once they have been served `retransmit_limit` times. The limit
//! scales with the logarithm of the cluster size.

use crate::peer::MemberCount;

/// Dissemination policy, configured independently of message content
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastPolicy {
    /// Multiplier applied to ceil(log10(n + 1))
    pub retransmit_mult: u32,
    /// Queue bound; the most-transmitted messages are pruned beyond it
    pub max_queue_depth: usize,
    /// Replace a queued message when a newer one with the same key arrives
    pub coalesce: bool,
}

impl Default for BroadcastPolicy {
    fn default() -> Self {
        Self {
            retransmit_mult: 3,
            max_queue_depth: 4096,
            coalesce: false,
        }
    }
}

impl BroadcastPolicy {
    /// Number of times a message is served to a cluster of `members` nodes
    pub fn retransmit_limit(&self, members: usize) -> u32 {
        let scale = ((members + 1) as f64).log10().ceil() as u32;
        self.retransmit_mult * scale
    }
}

#[derive(Debug)]
struct QueuedBroadcast {
    key: Option<String>,
    payload: Vec<u8>,
    transmits: u32,
    seq: u64,
}

/// Bounded outgoing queue for piggybacked messages
#[derive(Debug)]
pub struct TransmitLimitedQueue {
    policy: BroadcastPolicy,
    members: MemberCount,
    items: Vec<QueuedBroadcast>,
    next_seq: u64,
}

impl TransmitLimitedQueue {
    pub fn new(policy: BroadcastPolicy, members: MemberCount) -> Self {
        Self {
            policy,
            members,
            items: Vec::new(),
            next_seq: 0,
        }
    }

    /// Queue a message. `key` is only consulted when coalescing is enabled.
    pub fn queue(&mut self, key: Option<String>, payload: Vec<u8>) {
        if self.policy.coalesce {
            if let Some(key) = &key {
                self.items.retain(|item| item.key.as_ref() != Some(key));
            }
        }

        self.items.push(QueuedBroadcast {
            key,
            payload,
            transmits: 0,
            seq: self.next_seq,
        });
        self.next_seq += 1;

        if self.items.len() > self.policy.max_queue_depth {
            self.sort();
            self.items.truncate(self.policy.max_queue_depth);
        }
    }

    /// Messages fitting into `limit` bytes, each costing `overhead` extra.
    ///
    /// Every returned message counts one transmission.
    pub fn get_broadcasts(&mut self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        if self.items.is_empty() {
            return Vec::new();
        }

        let transmit_limit = self.policy.retransmit_limit(self.members.get());
        self.sort();

        let mut used = 0;
        let mut out = Vec::new();
        for item in self.items.iter_mut() {
            let cost = overhead + item.payload.len();
            if used + cost > limit {
                continue;
            }
            used += cost;
            item.transmits += 1;
            out.push(item.payload.clone());
        }

        self.items.retain(|item| item.transmits < transmit_limit);
        out
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn sort(&mut self) {
        self.items
            .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(b.seq.cmp(&a.seq)));
    }
}
