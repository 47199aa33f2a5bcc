//! Membership events and garbage collection of departed sources

use crate::store::Store;
use clap::ValueEnum;
use gossip_cache_net::NodeInfo;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Which membership signals purge a node's records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum GcTrigger {
    /// Only an explicit departure
    Leave,
    /// Only a state change of a live member
    StateChange,
    /// Either signal
    #[default]
    Both,
}

impl GcTrigger {
    fn on_leave(self) -> bool {
        matches!(self, GcTrigger::Leave | GcTrigger::Both)
    }

    fn on_state_change(self) -> bool {
        matches!(self, GcTrigger::StateChange | GcTrigger::Both)
    }
}

/// Lifecycle signal from the membership layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent<'a> {
    Joined(&'a NodeInfo),
    StateChanged(&'a NodeInfo),
    Left(&'a NodeInfo),
}

/// Oldest life of a collected source whose records are still accepted
#[derive(Debug, Clone, Copy)]
struct Fence {
    min_incarnation: u64,
    since: Instant,
}

/// Reacts to membership churn by pruning the store.
///
/// Every collected source is fenced so that late relays of records it
/// created before the collection cannot bring them back. A departed node is
/// fenced entirely; a restarted one only for lives older than the current
/// one. Fences expire after `fence_ttl`, by which time queued relays have run
/// out of retransmits.
#[derive(Debug)]
pub struct MembershipHandler {
    trigger: GcTrigger,
    fence_ttl: Duration,
    fences: HashMap<String, Fence>,
}

impl MembershipHandler {
    pub fn new(trigger: GcTrigger, fence_ttl: Duration) -> Self {
        Self {
            trigger,
            fence_ttl,
            fences: HashMap::new(),
        }
    }

    /// Apply one event, returning the number of entries removed
    pub fn handle(&mut self, event: MembershipEvent<'_>, store: &mut Store) -> usize {
        let now = Instant::now();
        self.prune_expired(now);

        match event {
            MembershipEvent::Joined(node) => {
                self.lower_fence(node, now);
                0
            }
            MembershipEvent::StateChanged(node) => {
                if !self.trigger.on_state_change() {
                    debug!("Ignoring state change of {} for GC", node.name);
                    self.lower_fence(node, now);
                    return 0;
                }
                self.fence(&node.name, node.incarnation, now);
                Self::collect(store, &node.name, "changed state")
            }
            MembershipEvent::Left(node) => {
                if !self.trigger.on_leave() {
                    debug!("Ignoring departure of {} for GC", node.name);
                    return 0;
                }
                self.fence(&node.name, u64::MAX, now);
                Self::collect(store, &node.name, "left")
            }
        }
    }

    /// Whether a record created by `node` during `incarnation` is refused
    pub fn is_refused(&self, node: &str, incarnation: u64) -> bool {
        self.fences
            .get(node)
            .is_some_and(|fence| incarnation < fence.min_incarnation)
    }

    /// Drop fences older than the TTL
    pub fn prune_expired(&mut self, now: Instant) {
        let ttl = self.fence_ttl;
        self.fences
            .retain(|_, fence| now.saturating_duration_since(fence.since) < ttl);
    }

    /// Number of sources currently fenced
    pub fn fenced(&self) -> usize {
        self.fences.len()
    }

    fn fence(&mut self, node: &str, min_incarnation: u64, now: Instant) {
        self.fences.insert(
            node.to_string(),
            Fence {
                min_incarnation,
                since: now,
            },
        );
    }

    /// A node seen alive: accept its current life again, keep older lives out
    fn lower_fence(&mut self, node: &NodeInfo, now: Instant) {
        if self.fences.contains_key(&node.name) {
            self.fence(&node.name, node.incarnation, now);
        }
    }

    fn collect(store: &mut Store, node: &str, reason: &str) -> usize {
        let removed = store.remove_by_source(node);
        if removed > 0 {
            info!("Removed {} record(s) sourced by {} ({})", removed, node, reason);
        }
        removed
    }
}

/// Metadata advertised for the local node; none is used.
pub fn node_metadata(_limit: usize) -> Vec<u8> {
    Vec::new()
}
