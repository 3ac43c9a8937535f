// src/core/cluster/slot.rs

//! Key -> slot hashing and the slot -> node routing table.
//!
//! Grounded on the teacher's `cluster/slot.rs` CRC16-based slot hashing and
//! hash-tag extraction, corrected to the XMODEM polynomial the specification
//! requires for Redis wire compatibility (the teacher's own slot hashing
//! uses a different named CRC16 constant for its own, unrelated cluster
//! wire format).

use bytes::Bytes;
use crc::{Crc, CRC_16_XMODEM};

/// Fixed slot-space size, matching the Redis Cluster keyspace partitioning.
pub const NUM_SLOTS: u16 = 16384;

static CRC16_ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Extracts the hash-tag portion of a key: the bytes between the first `{`
/// and the next `}`, provided there is at least one byte between them.
/// Falls back to the whole key otherwise.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close_rel) = key[open + 1..].iter().position(|&b| b == b'}') {
            if close_rel > 0 {
                return &key[open + 1..open + 1 + close_rel];
            }
        }
    }
    key
}

/// Computes the slot a key belongs to: `CRC16(tag(key)) % 16384`.
pub fn key_slot(key: &[u8]) -> u16 {
    let tag = hash_tag(key);
    let mut digest = CRC16_ALGO.digest();
    digest.update(tag);
    digest.finalize() % NUM_SLOTS
}

pub fn key_slot_bytes(key: &Bytes) -> u16 {
    key_slot(key.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tag_co_locates_keys() {
        assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"{user1000}.followers"));
        assert_eq!(key_slot(b"{X}:a"), key_slot(b"{X}:b"));
    }

    #[test]
    fn empty_braces_hash_whole_key() {
        // `{}` has zero bytes between the braces, so the whole key (including
        // the braces) is hashed instead of an empty tag.
        assert_eq!(key_slot(b"foo{}bar"), key_slot_of_whole(b"foo{}bar"));
    }

    fn key_slot_of_whole(key: &[u8]) -> u16 {
        let mut digest = CRC16_ALGO.digest();
        digest.update(key);
        digest.finalize() % NUM_SLOTS
    }

    #[test]
    fn slot_is_within_range() {
        for key in ["a", "b", "user:123", "{tag}:rest", ""] {
            assert!(key_slot(key.as_bytes()) < NUM_SLOTS);
        }
    }

    #[test]
    fn slot_is_deterministic() {
        let s1 = key_slot(b"user:123");
        let s2 = key_slot(b"user:123");
        assert_eq!(s1, s2);
    }
}
