//! TCP-based cluster membership
//!
//! Each exchange opens a short-lived connection carrying one request frame
//! and, for pings and joins, one response frame. Membership spreads by
//! piggybacking the member list on every gossip packet; failures are found by
//! direct probing.

use crate::delegate::{Delegate, DelegateError, EventDelegate};
use crate::framing::{Frame, FrameCodec, FrameError, FrameType};
use crate::peer::{MemberCount, NodeInfo};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Bytes of framing added to each piggybacked message
pub const MESSAGE_OVERHEAD: usize = 3;

/// Share of the packet budget the piggybacked member list may use
const MEMBER_SHARE_DIVISOR: usize = 2;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("Delegate error: {0}")]
    Delegate(#[from] DelegateError),
    #[error("Timed out talking to {0}")]
    Timeout(SocketAddr),
    #[error("Connection closed by {0}")]
    ConnectionClosed(SocketAddr),
    #[error("Unexpected frame {0:?}")]
    UnexpectedFrame(FrameType),
    #[error("Failed to join any of {0} seeds")]
    JoinFailed(usize),
    #[error("Cluster already running")]
    AlreadyRunning,
}

/// Cluster tuning
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Local member name; must be unique in the cluster
    pub name: String,
    /// Gossip listen address
    pub bind: SocketAddr,
    /// Address advertised to peers (defaults to the bound address)
    pub advertise: Option<SocketAddr>,
    /// Period between gossip rounds
    pub gossip_interval: Duration,
    /// Random members contacted per gossip round
    pub gossip_nodes: usize,
    /// Period between probe rounds
    pub probe_interval: Duration,
    /// Timeout for a single exchange
    pub probe_timeout: Duration,
    /// Consecutive failed probes before a member is declared left
    pub suspicion_probes: u32,
    /// Maximum gossip packet size in bytes
    pub packet_budget: usize,
    /// Incarnation of the local node; a fresh one if unset
    pub incarnation: Option<u64>,
    /// How long a departed member stays tombstoned
    pub tombstone_ttl: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise: None,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            suspicion_probes: 3,
            packet_budget: 1400,
            incarnation: None,
            tombstone_ttl: Duration::from_secs(600),
        }
    }
}

/// Wire messages
pub mod messages {
    use crate::peer::NodeInfo;
    use serde::{Deserialize, Serialize};

    /// Sent by a joining node to a seed
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct JoinRequest {
        pub node: NodeInfo,
        pub state: Vec<u8>,
    }

    /// Seed's answer to a join
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct JoinAck {
        pub node: NodeInfo,
        pub members: Vec<NodeInfo>,
        pub state: Vec<u8>,
    }

    /// Periodic gossip packet
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct GossipPacket {
        pub from: NodeInfo,
        pub members: Vec<NodeInfo>,
        pub messages: Vec<Vec<u8>>,
    }

    /// Graceful departure
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct LeaveNotice {
        pub node: NodeInfo,
    }
}

use messages::*;

#[derive(Debug, Clone)]
struct Member {
    info: NodeInfo,
    failures: u32,
}

/// How a member went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// Sent a leave notice
    Left,
    /// Stopped answering probes
    Failed,
}

/// A departed member. A failed one is pinged for recovery until it expires.
#[derive(Debug, Clone)]
struct Tombstone {
    info: NodeInfo,
    departure: Departure,
    at: Instant,
}

/// Membership change to report once locks are released
enum Change {
    Joined(NodeInfo),
    Updated(NodeInfo),
    Left(NodeInfo),
}

/// A running cluster member
pub struct Cluster {
    config: ClusterConfig,
    local: NodeInfo,
    listener: Mutex<Option<TcpListener>>,
    members: RwLock<HashMap<String, Member>>,
    /// Departed members by name, with the incarnation they left with
    departed: RwLock<HashMap<String, Tombstone>>,
    member_count: MemberCount,
    delegate: Arc<dyn Delegate>,
    events: Arc<dyn EventDelegate>,
    /// First delegate error; stops the cluster
    fatal: Mutex<Option<DelegateError>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Cluster {
    /// Bind the gossip listener. No traffic flows until [`Cluster::run`].
    pub async fn create(
        config: ClusterConfig,
        delegate: Arc<dyn Delegate>,
        events: Arc<dyn EventDelegate>,
        member_count: MemberCount,
    ) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(config.bind).await?;
        let addr = match config.advertise {
            Some(addr) => addr,
            None => listener.local_addr()?,
        };
        let local = match config.incarnation {
            Some(incarnation) => NodeInfo::with_incarnation(config.name.clone(), addr, incarnation),
            None => NodeInfo::new(config.name.clone(), addr),
        };
        member_count.set(1);

        let (shutdown_tx, _) = broadcast::channel(1);

        info!("Cluster member {} (incarnation {})", local, local.incarnation);

        Ok(Arc::new(Self {
            config,
            local,
            listener: Mutex::new(Some(listener)),
            members: RwLock::new(HashMap::new()),
            departed: RwLock::new(HashMap::new()),
            member_count,
            delegate,
            events,
            fatal: Mutex::new(None),
            shutdown_tx,
        }))
    }

    /// Local member name
    pub fn local_identity(&self) -> &str {
        &self.local.name
    }

    /// Local member info
    pub fn local_node(&self) -> &NodeInfo {
        &self.local
    }

    /// Live members including the local node
    pub fn member_count(&self) -> usize {
        self.members.read().len() + 1
    }

    /// Live remote members
    pub fn members(&self) -> Vec<NodeInfo> {
        self.members.read().values().map(|m| m.info.clone()).collect()
    }

    /// Join through the given seeds, exchanging full state with each.
    ///
    /// Returns the number of seeds contacted; fails only if none answered.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize, TransportError> {
        let mut joined = 0;
        for seed in seeds {
            match self.join_one(*seed).await {
                Ok(()) => joined += 1,
                Err(TransportError::Delegate(e)) => return Err(TransportError::Delegate(e)),
                Err(e) => warn!("Join via {} failed: {}", seed, e),
            }
        }

        if joined == 0 && !seeds.is_empty() {
            return Err(TransportError::JoinFailed(seeds.len()));
        }
        info!("Joined cluster via {} seed(s), {} members", joined, self.member_count());
        Ok(joined)
    }

    async fn join_one(&self, seed: SocketAddr) -> Result<(), TransportError> {
        let request = JoinRequest {
            node: self.local.clone(),
            state: self.delegate.snapshot_state(true)?,
        };
        let frame = Frame::new(FrameType::Join, postcard::to_allocvec(&request)?);

        let reply = self.exchange(seed, frame, true).await?;
        let reply = reply.ok_or(TransportError::ConnectionClosed(seed))?;
        if reply.frame_type != FrameType::JoinAck {
            return Err(TransportError::UnexpectedFrame(reply.frame_type));
        }
        let ack: JoinAck = postcard::from_bytes(&reply.payload)?;

        debug!("Join ack from {} with {} members", ack.node, ack.members.len());
        self.delegate.merge_state(&ack.state, true)?;

        self.admit(ack.node, true);
        for member in ack.members {
            self.admit(member, false);
        }
        Ok(())
    }

    /// Serve until shutdown or a delegate error.
    pub async fn run(self: Arc<Self>) -> Result<(), TransportError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(TransportError::AlreadyRunning)?;
        info!("Gossip listening on {}", self.local.addr);

        let gossip_handle = self.clone().spawn_gossip_task();
        let probe_handle = self.clone().spawn_probe_task();

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let cluster = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = cluster.handle_connection(stream).await {
                                    debug!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        gossip_handle.abort();
        probe_handle.abort();

        match self.fatal.lock().take() {
            Some(e) => Err(TransportError::Delegate(e)),
            None => Ok(()),
        }
    }

    /// Tell every member we are leaving, then stop.
    pub async fn leave(&self) {
        let notice = LeaveNotice {
            node: self.local.clone(),
        };
        match postcard::to_allocvec(&notice) {
            Ok(payload) => {
                let frame = Frame::new(FrameType::Leave, payload);
                let sends = self
                    .members()
                    .into_iter()
                    .map(|m| self.exchange(m.addr, frame.clone(), false));
                for result in futures::future::join_all(sends).await {
                    if let Err(e) = result {
                        debug!("Leave notice failed: {}", e);
                    }
                }
            }
            Err(e) => warn!("Failed to encode leave notice: {}", e),
        }
        info!("Left cluster");
        self.shutdown();
    }

    /// Stop without notifying peers
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn fail(&self, error: DelegateError) {
        error!("Stopping cluster: {}", error);
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(error);
        }
        drop(fatal);
        self.shutdown();
    }

    /// Send one frame and optionally wait for one reply
    async fn exchange(
        &self,
        addr: SocketAddr,
        frame: Frame,
        expect_reply: bool,
    ) -> Result<Option<Frame>, TransportError> {
        let wait = if expect_reply {
            // joins carry full state and may take longer than a probe
            self.config.probe_timeout * 4
        } else {
            self.config.probe_timeout
        };
        timeout(wait, send_frame(addr, frame, expect_reply))
            .await
            .map_err(|_| TransportError::Timeout(addr))?
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), TransportError> {
        let mut framed = Framed::new(stream, FrameCodec::new());
        let frame = match framed.next().await {
            Some(frame) => frame?,
            None => return Ok(()),
        };

        match frame.frame_type {
            FrameType::Ping => {
                framed.send(Frame::pong()).await?;
            }
            FrameType::Join => {
                let request: JoinRequest = postcard::from_bytes(&frame.payload)?;
                debug!("Join request from {}", request.node);

                let joiner = request.node.clone();
                self.admit(request.node, true);

                let state = match self.delegate.snapshot_state(true) {
                    Ok(state) => state,
                    Err(e) => {
                        self.fail(e);
                        return Ok(());
                    }
                };
                let ack = JoinAck {
                    node: self.local.clone(),
                    members: self
                        .members()
                        .into_iter()
                        .filter(|m| m.name != joiner.name)
                        .collect(),
                    state,
                };
                framed
                    .send(Frame::new(FrameType::JoinAck, postcard::to_allocvec(&ack)?))
                    .await?;

                if let Err(e) = self.delegate.merge_state(&request.state, true) {
                    self.fail(e);
                }
            }
            FrameType::Gossip => {
                let packet: GossipPacket = postcard::from_bytes(&frame.payload)?;
                let from = packet.from.addr;
                if self.admit(packet.from, true) {
                    tokio::spawn(self.clone().resync(from));
                }
                for member in packet.members {
                    self.admit(member, false);
                }
                for message in packet.messages {
                    if let Err(e) = self.delegate.handle_incoming_message(&message) {
                        self.fail(e);
                        break;
                    }
                }
            }
            FrameType::Leave => {
                let notice: LeaveNotice = postcard::from_bytes(&frame.payload)?;
                self.depart(&notice.node, Departure::Left);
            }
            other => return Err(TransportError::UnexpectedFrame(other)),
        }
        Ok(())
    }

    /// Record a member sighting. `direct` means the member itself talked to us.
    ///
    /// Returns true when a member declared failed turned out to be alive; its
    /// state then needs a fresh exchange.
    fn admit(&self, info: NodeInfo, direct: bool) -> bool {
        if info.name == self.local.name {
            return false;
        }

        let mut recovered = false;
        let change = {
            let mut departed = self.departed.write();
            if let Some(tombstone) = departed.get(&info.name) {
                let same_life = info.incarnation == tombstone.info.incarnation;
                recovered = direct && same_life && tombstone.departure == Departure::Failed;
                if info.incarnation <= tombstone.info.incarnation && !recovered {
                    return false;
                }
                departed.remove(&info.name);
            }

            let mut members = self.members.write();
            let change = match members.get_mut(&info.name) {
                Some(member) if member.info.is_superseded_by(&info) => {
                    member.info = info.clone();
                    member.failures = 0;
                    Some(Change::Updated(info.clone()))
                }
                Some(member) => {
                    if direct {
                        member.failures = 0;
                    }
                    None
                }
                None => {
                    members.insert(
                        info.name.clone(),
                        Member {
                            info: info.clone(),
                            failures: 0,
                        },
                    );
                    Some(Change::Joined(info.clone()))
                }
            };
            self.member_count.set(members.len() + 1);
            change
        };

        if recovered {
            info!("Member {} recovered", info);
        }
        if let Some(change) = change {
            self.notify(change);
        }
        recovered
    }

    /// Remove a member and tombstone its incarnation
    fn depart(&self, info: &NodeInfo, departure: Departure) {
        let removed = {
            let mut departed = self.departed.write();
            let mut members = self.members.write();
            let removed = match members.get(&info.name) {
                Some(member) if member.info.incarnation <= info.incarnation => {
                    members.remove(&info.name)
                }
                _ => None,
            };
            let newer = departed
                .get(&info.name)
                .map_or(true, |t| t.info.incarnation <= info.incarnation);
            if newer {
                let info = removed.as_ref().map_or_else(|| info.clone(), |m| m.info.clone());
                departed.insert(
                    info.name.clone(),
                    Tombstone {
                        info,
                        departure,
                        at: Instant::now(),
                    },
                );
            }
            self.member_count.set(members.len() + 1);
            removed
        };

        if let Some(member) = removed {
            match departure {
                Departure::Left => info!("Member {} left", member.info),
                Departure::Failed => info!("Member {} failed", member.info),
            }
            self.notify(Change::Left(member.info));
        }
    }

    /// Forget tombstones older than the configured TTL
    fn prune_tombstones(&self, now: Instant) {
        let ttl = self.config.tombstone_ttl;
        self.departed
            .write()
            .retain(|_, t| now.saturating_duration_since(t.at) < ttl);
    }

    /// A failed member to contact in case it is still alive
    fn recovery_target(&self) -> Option<NodeInfo> {
        let departed = self.departed.read();
        let failed: Vec<&Tombstone> = departed
            .values()
            .filter(|t| t.departure == Departure::Failed)
            .collect();
        failed
            .choose(&mut rand::thread_rng())
            .map(|t| t.info.clone())
    }

    /// Full state exchange with a member that came back
    async fn resync(self: Arc<Self>, addr: SocketAddr) {
        match self.join_one(addr).await {
            Ok(()) => debug!("Resynchronized with {}", addr),
            Err(TransportError::Delegate(e)) => self.fail(e),
            Err(e) => debug!("Resync with {} failed: {}", addr, e),
        }
    }

    fn notify(&self, change: Change) {
        match change {
            Change::Joined(info) => {
                info!("Member {} joined", info);
                self.events.on_join(&info);
            }
            Change::Updated(info) => {
                info!("Member {} changed state", info);
                self.events.on_state_change(&info);
            }
            Change::Left(info) => self.events.on_leave(&info),
        }
    }

    fn spawn_gossip_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(self.config.gossip_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.gossip_round().await;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    async fn gossip_round(&self) {
        let members = self.members();
        let mut targets: Vec<NodeInfo> = members
            .choose_multiple(&mut rand::thread_rng(), self.config.gossip_nodes)
            .cloned()
            .collect();
        targets.extend(self.recovery_target());

        for target in targets {
            let (payload, carried) = match self.gossip_payload(&members) {
                Ok(built) => built,
                Err(e) => {
                    warn!("Failed to encode gossip packet: {}", e);
                    return;
                }
            };
            if carried > 0 {
                debug!("Gossiping {} message(s) to {}", carried, target);
            }
            let frame = Frame::new(FrameType::Gossip, payload);
            if let Err(e) = self.exchange(target.addr, frame, false).await {
                debug!("Gossip to {} failed: {}", target, e);
            }
        }
    }

    /// Encode one gossip packet, returning it with the number of messages
    /// it carries.
    ///
    /// The member list is a random subset limited to a share of the packet
    /// budget, so messages keep room however large the cluster grows.
    fn gossip_payload(&self, members: &[NodeInfo]) -> Result<(Vec<u8>, usize), postcard::Error> {
        let mut shared = members.to_vec();
        shared.shuffle(&mut rand::thread_rng());

        let member_budget = self.config.packet_budget / MEMBER_SHARE_DIVISOR;
        let mut used = 0;
        let mut keep = 0;
        for member in &shared {
            let size = postcard::to_allocvec(member)?.len();
            if used + size > member_budget {
                break;
            }
            used += size;
            keep += 1;
        }
        shared.truncate(keep);

        let mut packet = GossipPacket {
            from: self.local.clone(),
            members: shared,
            messages: Vec::new(),
        };
        let base = postcard::to_allocvec(&packet)?.len();
        let budget = self.config.packet_budget.saturating_sub(base);
        packet.messages = self
            .delegate
            .pending_outgoing_messages(MESSAGE_OVERHEAD, budget);

        let carried = packet.messages.len();
        Ok((postcard::to_allocvec(&packet)?, carried))
    }

    fn spawn_probe_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(self.config.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.probe_round().await;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    async fn probe_round(&self) {
        self.prune_tombstones(Instant::now());
        let members = self.members();
        let probes = members.iter().map(|m| async move {
            let result = self.exchange(m.addr, Frame::ping(), true).await;
            let alive = matches!(result, Ok(Some(ref f)) if f.frame_type == FrameType::Pong);
            (m, alive)
        });

        for (member, alive) in futures::future::join_all(probes).await {
            if alive {
                if let Some(m) = self.members.write().get_mut(&member.name) {
                    m.failures = 0;
                }
                continue;
            }

            let failures = match self.members.write().get_mut(&member.name) {
                Some(m) => {
                    m.failures += 1;
                    m.failures
                }
                None => continue,
            };
            debug!("Probe of {} failed ({} in a row)", member, failures);
            if failures >= self.config.suspicion_probes {
                self.depart(member, Departure::Failed);
            }
        }
    }
}

async fn send_frame(
    addr: SocketAddr,
    frame: Frame,
    expect_reply: bool,
) -> Result<Option<Frame>, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed.send(frame).await?;
    if !expect_reply {
        return Ok(None);
    }
    match framed.next().await {
        Some(reply) => Ok(Some(reply?)),
        None => Err(TransportError::ConnectionClosed(addr)),
    }
}
