// src/core/storage/mod.rs

//! The local store: entries, eviction, the membership filter,
//! and the TTL sweeper that complements lazy expiration.

pub mod entry;
pub mod eviction;
pub mod filter;
pub mod store;
pub mod ttl;

pub use entry::Entry;
pub use eviction::EvictionPolicyKind;
pub use store::{SetOutcome, Store, StoreConfig};
pub use ttl::TtlSweeper;
