//! Encodings for gossip-cache
//!
//! Inter-node payloads (broadcasts and join snapshots) use postcard with
//! strict decoding: trailing bytes are rejected. Client-facing bodies use
//! JSON to stay compatible with plain HTTP clients.

use crate::error::{Error, Result};
use crate::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Domain separator for store digests
const DIGEST_CONTEXT: &[u8] = b"gossip-cache-state-v1:";

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, rest) = postcard::take_from_bytes(bytes)?;
    if !rest.is_empty() {
        return Err(Error::TrailingBytes(rest.len()));
    }
    Ok(value)
}

/// Encode a creation broadcast for the gossip queue
pub fn encode_broadcast(broadcast: &Broadcast) -> Result<Vec<u8>> {
    encode(broadcast)
}

/// Decode a broadcast received from a peer
pub fn decode_broadcast(bytes: &[u8]) -> Result<Broadcast> {
    decode(bytes)
}

/// Encode a full-state snapshot for join transfer
pub fn encode_state(entries: &[CacheEntry]) -> Result<Vec<u8>> {
    encode(entries)
}

/// Decode a full-state snapshot received during join
pub fn decode_state(bytes: &[u8]) -> Result<Vec<CacheEntry>> {
    decode(bytes)
}

/// Parse a client-submitted record. Both `id` and `name` are required.
pub fn record_from_json(body: &[u8]) -> Result<Record> {
    serde_json::from_slice(body).map_err(Error::from)
}

/// Serialize a record listing for clients
pub fn records_to_json(records: &[Record]) -> Result<Vec<u8>> {
    serde_json::to_vec(records).map_err(Error::from)
}

/// Order-independent digest over a set of entries.
///
/// Entries are hashed in ascending id order, each in its postcard encoding.
pub fn digest_entries<'a, I>(entries: I) -> Result<[u8; 32]>
where
    I: IntoIterator<Item = &'a CacheEntry>,
{
    let mut sorted: Vec<&CacheEntry> = entries.into_iter().collect();
    sorted.sort_by_key(|e| e.record.id);

    let mut hasher = blake3::Hasher::new();
    hasher.update(DIGEST_CONTEXT);
    for entry in sorted {
        hasher.update(&encode(entry)?);
    }
    Ok(*hasher.finalize().as_bytes())
}

/// Short hex form of a digest for logs
pub fn short_digest(digest: &[u8; 32]) -> String {
    hex::encode(&digest[..8])
}
