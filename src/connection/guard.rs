// src/connection/guard.rs

//! RAII guard for the connection count, backing the `max_connections`
//! back-pressure rule: excess accepts are closed immediately.
//!
//! Decrements the counter on `Drop`, so cleanup happens whether the
//! connection exits via a normal return, an error, or a panic. Reduced to
//! just the live-connection counter that `server::accept_loop` checks
//! against `server.max_connections` before accepting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Held for the lifetime of one accepted connection. Increments the shared
/// counter on construction, decrements it on drop so a connection that
/// exits via an error, a timeout, or a clean close always frees its slot.
pub struct ConnectionGuard {
    active_connections: Arc<AtomicUsize>,
    addr: SocketAddr,
}

impl ConnectionGuard {
    /// Increments `active_connections` and returns a guard that will
    /// decrement it again on drop. Callers are expected to have already
    /// checked `active_connections.load(..) < max_connections` before
    /// accepting; this constructor performs the increment unconditionally.
    pub fn new(active_connections: Arc<AtomicUsize>, addr: SocketAddr) -> Self {
        active_connections.fetch_add(1, Ordering::Relaxed);
        Self {
            active_connections,
            addr,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        debug!(addr = %self.addr, "connection closed");
    }
}
