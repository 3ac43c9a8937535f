// src/core/storage/ttl.rs

//! The periodic TTL sweeper: "expiration is checked on read
//! (lazy) and by a periodic sweeper every `cleanup_interval`."
//!
//! Grounded on the teacher's active-expiration background task (originally
//! `core/storage/ttl.rs`'s sampling loop against a sharded `Db`), adapted to
//! sweep this crate's single `Store` per node by iterating its entries —
//! the `Store`'s `iterate` already skips lazily-expired entries, so the
//! sweeper only needs to additionally *remove* what it finds, which
//! `Store::get` on the same key would otherwise do lazily on next access.

use super::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub struct TtlSweeper {
    store: Arc<Store>,
    interval: Duration,
}

impl TtlSweeper {
    pub fn new(store: Arc<Store>, interval: Duration) -> Self {
        TtlSweeper { store, interval }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(interval_ms = self.interval.as_millis(), "TTL sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                _ = shutdown_rx.recv() => {
                    info!("TTL sweeper shutting down");
                    return;
                }
            }
        }
    }

    fn sweep(&self) {
        let expired_keys = self.store.expired_keys();
        let purged = expired_keys.len();
        for key in expired_keys {
            self.store.delete(&key);
        }
        if purged > 0 {
            debug!(purged, "TTL sweeper purged expired keys");
        }
    }
}
