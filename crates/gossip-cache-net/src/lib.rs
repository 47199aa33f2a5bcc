//! Membership substrate for gossip-cache
//!
//! This crate provides:
//! - Node identity and incarnation tracking
//! - Length-prefixed message framing
//! - A retransmit-limited broadcast queue
//! - TCP-based cluster join, gossip, probing and leave
//! - The delegate traits through which the cache plugs in

pub mod delegate;
pub mod framing;
pub mod peer;
pub mod queue;
pub mod transport;

pub use delegate::{Delegate, DelegateError, EventDelegate};
pub use framing::{Frame, FrameCodec, FrameType};
pub use peer::{fresh_incarnation, MemberCount, NodeInfo};
pub use queue::{BroadcastPolicy, TransmitLimitedQueue};
pub use transport::{Cluster, ClusterConfig, TransportError};
