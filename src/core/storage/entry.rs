// src/core/storage/entry.rs

//! The unit stored by a `Store`.
//!
//! Grounded on the teacher's `core/storage/data_types.rs` `StoredValue`
//! (value + expiry + version metadata colocated on one struct) generalized
//! to the single opaque byte-string value this crate's data model calls for,
//! plus the `source_tag` provenance field asks for so the
//! replication-apply path can mark entries as
//! `source = "replication"` without re-publishing them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed per-entry bookkeeping overhead counted against the memory ceiling,
/// approximating the `Entry` struct's own heap/stack footprint beyond the
/// key and value bytes themselves.
const ENTRY_OVERHEAD_BYTES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_access: DateTime<Utc>,
    pub source_tag: String,
}

impl Entry {
    pub fn new(
        key: Bytes,
        value: Bytes,
        ttl: Option<chrono::Duration>,
        source_tag: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Entry {
            key,
            value,
            created_at: now,
            expires_at: ttl.map(|d| now + d),
            last_access: now,
            source_tag: source_tag.into(),
        }
    }

    /// An entry with `expires_at <= now` is logically absent and
    /// MUST NOT be returned by `get`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn touch(&mut self) {
        self.last_access = Utc::now();
    }

    /// Bytes counted against the store's memory ceiling.
    pub fn memory_size(&self) -> usize {
        self.key.len() + self.value.len() + ENTRY_OVERHEAD_BYTES
    }

    pub fn remaining_ttl(&self) -> Option<chrono::Duration> {
        self.expires_at.map(|exp| exp - Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_expiry_never_expires() {
        let e = Entry::new(Bytes::from_static(b"k"), Bytes::from_static(b"v"), None, "client");
        assert!(!e.is_expired());
    }

    #[test]
    fn past_ttl_is_expired() {
        let mut e = Entry::new(
            Bytes::from_static(b"k"),
            Bytes::from_static(b"v"),
            Some(chrono::Duration::milliseconds(1)),
            "client",
        );
        e.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(e.is_expired());
    }

    #[test]
    fn memory_size_accounts_for_key_and_value() {
        let e = Entry::new(
            Bytes::from_static(b"hello"),
            Bytes::from_static(b"world!"),
            None,
            "client",
        );
        assert_eq!(e.memory_size(), 5 + 6 + ENTRY_OVERHEAD_BYTES);
    }
}
