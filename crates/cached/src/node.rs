//! The replicated cache node
//!
//! `CacheNode` owns the store and the outgoing broadcast queue behind a
//! single mutex. Client requests, gossip delivery, membership events and
//! join merges all go through it.

use crate::broadcast::{self, BroadcastError, Disseminator};
use crate::membership::{self, GcTrigger, MembershipEvent, MembershipHandler};
use crate::store::{InsertOutcome, Store};
use crate::sync::{self, MergePolicy, SyncError};
use clap::ValueEnum;
use gossip_cache_core::codec;
use gossip_cache_core::types::*;
use gossip_cache_net::{
    BroadcastPolicy, Delegate, DelegateError, EventDelegate, MemberCount, NodeInfo,
};
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Client-facing errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed record: {0}")]
    Malformed(gossip_cache_core::Error),
    #[error("serialization failed: {0}")]
    Serialization(gossip_cache_core::Error),
}

/// Result of a client create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// What to do with a malformed inter-node payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProtocolErrorPolicy {
    /// Log and drop the payload
    #[default]
    Discard,
    /// Stop the node
    FailFast,
}

/// Replication behavior of a node
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub broadcast: BroadcastPolicy,
    /// Re-broadcast creations learned from peers
    pub relay: bool,
    pub gc_trigger: GcTrigger,
    pub merge_policy: MergePolicy,
    pub protocol_errors: ProtocolErrorPolicy,
    /// How long a collected source stays fenced
    pub fence_ttl: Duration,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            broadcast: BroadcastPolicy::default(),
            relay: true,
            gc_trigger: GcTrigger::default(),
            merge_policy: MergePolicy::default(),
            protocol_errors: ProtocolErrorPolicy::default(),
            fence_ttl: Duration::from_secs(600),
        }
    }
}

/// State guarded by the node's lock
#[derive(Debug)]
struct Replica {
    store: Store,
    disseminator: Disseminator,
    membership: MembershipHandler,
}

/// Point-in-time summary of a node
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub records: usize,
    pub pending_broadcasts: usize,
    pub members: usize,
    /// Collected sources whose older records are still refused
    pub fenced_sources: usize,
    pub digest: [u8; 32],
}

/// A cache replica
pub struct CacheNode {
    name: String,
    incarnation: u64,
    settings: NodeSettings,
    members: MemberCount,
    replica: Mutex<Replica>,
}

impl CacheNode {
    /// A replica for the local node's life `incarnation`; it must match the
    /// incarnation the cluster advertises.
    pub fn new(
        name: impl Into<String>,
        incarnation: u64,
        settings: NodeSettings,
        members: MemberCount,
    ) -> Self {
        let replica = Replica {
            store: Store::new(),
            disseminator: Disseminator::new(settings.broadcast.clone(), members.clone()),
            membership: MembershipHandler::new(settings.gc_trigger, settings.fence_ttl),
        };

        Self {
            name: name.into(),
            incarnation,
            settings,
            members,
            replica: Mutex::new(replica),
        }
    }

    /// Local node identity, recorded as the source of local creates
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Every record, unordered
    pub fn list_records(&self) -> Vec<Record> {
        self.replica.lock().store.list()
    }

    /// Create a record sourced by this node and schedule its broadcast.
    ///
    /// Returns before any peer has seen the record.
    pub fn create_record(&self, record: Record) -> Result<CreateOutcome, ApiError> {
        let mut replica = self.replica.lock();
        if replica.store.contains(record.id) {
            debug!("Create of existing record {} ignored", record.id);
            return Ok(CreateOutcome::AlreadyExists);
        }

        // enqueue first so a failed encode leaves the store untouched
        replica
            .disseminator
            .enqueue(&record, &self.name, self.incarnation)
            .map_err(|e| match e {
                BroadcastError::Encode(e) | BroadcastError::Malformed(e) => {
                    ApiError::Serialization(e)
                }
            })?;
        let id = record.id;
        let outcome = replica.store.try_insert(record, &self.name, self.incarnation);
        debug_assert_eq!(outcome, InsertOutcome::Inserted);

        debug!("Created record {}", id);
        Ok(CreateOutcome::Created)
    }

    /// Parse a JSON body and create the record it describes
    pub fn create_from_json(&self, body: &[u8]) -> Result<CreateOutcome, ApiError> {
        let record = codec::record_from_json(body).map_err(ApiError::Malformed)?;
        self.create_record(record)
    }

    /// Entries with their sources, for inspection
    pub fn entries(&self) -> Vec<CacheEntry> {
        sync::snapshot_for_transfer(&self.replica.lock().store)
    }

    pub fn stats(&self) -> NodeStats {
        let replica = self.replica.lock();
        NodeStats {
            records: replica.store.len(),
            pending_broadcasts: replica.disseminator.pending(),
            members: self.members.get(),
            fenced_sources: replica.membership.fenced(),
            digest: replica.store.digest().unwrap_or_default(),
        }
    }

    fn membership_event(&self, event: MembershipEvent<'_>) {
        let mut replica = self.replica.lock();
        let Replica {
            store, membership, ..
        } = &mut *replica;
        membership.handle(event, store);
    }

    /// Records from an older life of this node or from a fenced source
    fn refuses(&self, membership: &MembershipHandler, node: &str, incarnation: u64) -> bool {
        (node == self.name && incarnation < self.incarnation)
            || membership.is_refused(node, incarnation)
    }

    fn protocol_failure(
        &self,
        what: &str,
        error: impl std::fmt::Display,
    ) -> Result<(), DelegateError> {
        match self.settings.protocol_errors {
            ProtocolErrorPolicy::Discard => {
                warn!("Discarding malformed {}: {}", what, error);
                Ok(())
            }
            ProtocolErrorPolicy::FailFast => {
                Err(DelegateError::Protocol(format!("malformed {}: {}", what, error)))
            }
        }
    }
}

impl Delegate for CacheNode {
    fn node_metadata(&self, limit: usize) -> Vec<u8> {
        membership::node_metadata(limit)
    }

    fn handle_incoming_message(&self, message: &[u8]) -> Result<(), DelegateError> {
        let broadcast = match broadcast::decode(message) {
            Ok(broadcast) => broadcast,
            Err(e) => return self.protocol_failure("broadcast", e),
        };

        let mut replica = self.replica.lock();
        if self.refuses(&replica.membership, &broadcast.node, broadcast.incarnation) {
            debug!(
                "Dropping record {} from collected node {} (incarnation {})",
                broadcast.record.id, broadcast.node, broadcast.incarnation
            );
            return Ok(());
        }

        let relay = self.settings.relay.then(|| broadcast.clone());
        let id = broadcast.record.id;
        match broadcast::apply(&mut replica.store, broadcast) {
            InsertOutcome::Inserted => {
                debug!("Applied record {}", id);
                if let Some(broadcast) = relay {
                    replica.disseminator.relay(&broadcast, message.to_vec());
                }
            }
            InsertOutcome::AlreadyExists => {}
        }
        Ok(())
    }

    fn pending_outgoing_messages(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.replica.lock().disseminator.drain(overhead, limit)
    }

    fn snapshot_state(&self, _for_join: bool) -> Result<Vec<u8>, DelegateError> {
        sync::encode_snapshot(&self.replica.lock().store)
            .map_err(|e| DelegateError::Encoding(e.to_string()))
    }

    fn merge_state(&self, state: &[u8], for_join: bool) -> Result<(), DelegateError> {
        let remote = match sync::decode_snapshot(state) {
            Ok(remote) => remote,
            Err(e @ SyncError::Malformed(_)) => return self.protocol_failure("snapshot", e),
            Err(e) => return Err(DelegateError::Encoding(e.to_string())),
        };

        let mut replica = self.replica.lock();
        let Replica {
            store, membership, ..
        } = &mut *replica;
        let report = sync::merge_on_join(
            store,
            remote,
            for_join,
            self.settings.merge_policy,
            |source, incarnation| self.refuses(membership, source, incarnation),
        );
        if report.changed() || report.conflicts > 0 {
            info!(
                "Join merge: {} inserted, {} replaced, {} conflicts, {} skipped",
                report.inserted, report.replaced, report.conflicts, report.skipped
            );
        }
        Ok(())
    }
}

impl EventDelegate for CacheNode {
    fn on_join(&self, node: &NodeInfo) {
        self.membership_event(MembershipEvent::Joined(node));
    }

    fn on_leave(&self, node: &NodeInfo) {
        self.membership_event(MembershipEvent::Left(node));
    }

    fn on_state_change(&self, node: &NodeInfo) {
        self.membership_event(MembershipEvent::StateChanged(node));
    }
}
