//! gossip-cache core library
//!
//! This crate provides the record types shared by every node of a
//! gossip-cache cluster and the encodings used to move them around.
//!
//! # Modules
//!
//! - [`types`]: Records, cache entries and creation broadcasts
//! - [`codec`]: Inter-node (postcard) and client-facing (JSON) encodings
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use types::*;
