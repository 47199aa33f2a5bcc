//! cached - gossip-cache replica daemon
//!
//! This daemon provides:
//! - A create-only record store keyed by id
//! - Epidemic dissemination of creations
//! - Garbage collection of a node's records when it leaves
//! - Full-state merge when a node joins
//! - A JSON HTTP API for clients

pub mod api;
pub mod broadcast;
pub mod config;
pub mod membership;
pub mod node;
pub mod server;
pub mod store;
pub mod sync;

#[cfg(test)]
mod scenarios;

pub use config::Config;
pub use node::{CacheNode, CreateOutcome, NodeSettings};
pub use server::Server;
pub use store::Store;
