//! Fixed wire vectors for the inter-node encoding.
//!
//! Peers running different builds must agree on these bytes; a change here
//! is a protocol version bump.

use crate::codec::*;
use crate::types::*;

#[test]
fn create_broadcast_bytes() {
    let broadcast = Broadcast::create(Record::new(1, "x"), "a", 3);
    let bytes = encode_broadcast(&broadcast).unwrap();

    // zigzag varint id, len-prefixed name, len-prefixed node, varint
    // incarnation, action index
    assert_eq!(bytes, vec![0x02, 0x01, b'x', 0x01, b'a', 0x03, 0x00]);
    assert_eq!(decode_broadcast(&bytes).unwrap(), broadcast);
}

#[test]
fn negative_id_bytes() {
    let broadcast = Broadcast::create(Record::new(-1, ""), "n", 0);
    let bytes = encode_broadcast(&broadcast).unwrap();
    assert_eq!(bytes, vec![0x01, 0x00, 0x01, b'n', 0x00, 0x00]);
}

#[test]
fn wide_incarnation_bytes() {
    // millisecond incarnations take several varint bytes
    let broadcast = Broadcast::create(Record::new(0, ""), "n", 300);
    let bytes = encode_broadcast(&broadcast).unwrap();
    assert_eq!(bytes, vec![0x00, 0x00, 0x01, b'n', 0xac, 0x02, 0x00]);
}

#[test]
fn state_snapshot_bytes() {
    let entries = vec![CacheEntry::new(Record::new(2, "y"), "b", 7)];
    let bytes = encode_state(&entries).unwrap();

    // sequence length, then each entry in field order
    assert_eq!(bytes, vec![0x01, 0x04, 0x01, b'y', 0x01, b'b', 0x07]);
}

#[test]
fn broadcast_key_scopes_by_id() {
    let first = Broadcast::create(Record::new(9, "x"), "a", 1);
    let second = Broadcast::create(Record::new(9, "y"), "b", 2);
    assert_eq!(first.key(), second.key());
    assert_eq!(first.key(), "create:9");
}
