// src/connection/handler.rs

//! Per-connection state machine: `reading-frame ->
//! parsing-args -> executing -> writing-reply -> reading-frame`, with
//! `closing` reachable from any state on I/O error, timeout, or server
//! stop. Pipelining is handled for free by `RespCodec`/`Framed`: as many
//! complete frames as are already buffered decode before the socket is
//! read again, and replies are written in arrival order.
//!
//! A `Framed` loop selects between a shutdown signal and `framed.next()`,
//! routing the command through the cluster slot table before it is ever
//! handed to `commands::execute`: HyperCache has no replica streaming, no
//! pub/sub, and no `MULTI`/`EXEC`, so every key-bearing command only needs
//! a routing check ahead of dispatch.

use super::guard::ConnectionGuard;
use crate::core::commands::{self, Command};
use crate::core::errors::HyperCacheError;
use crate::core::protocol::{RespCodec, RespFrame};
use crate::server::Coordinator;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Owns one accepted TCP connection end to end.
pub struct ConnectionHandler {
    framed: Framed<TcpStream, RespCodec>,
    addr: SocketAddr,
    coordinator: Arc<Coordinator>,
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, addr: SocketAddr, coordinator: Arc<Coordinator>) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            framed: Framed::new(stream, RespCodec),
            addr,
            coordinator,
        }
    }

    /// Runs the connection to completion. Returns `Ok(())` on a graceful
    /// close (peer disconnect, idle timeout, server shutdown) and `Err`
    /// only for I/O failures worth logging at the call site.
    pub async fn run(mut self) -> Result<(), HyperCacheError> {
        let _guard = ConnectionGuard::new(Arc::clone(&self.coordinator.active_connections), self.addr);
        let idle_timeout = self.coordinator.config.server.idle_timeout;
        let command_timeout = self.coordinator.config.server.command_timeout;
        let mut shutdown_rx = self.coordinator.subscribe_shutdown();

        loop {
            // reading-frame: wait for the next complete frame, bounded by
            // the idle timeout, or fall to `closing` on a shutdown signal.
            let frame = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    let _ = self.framed.send(RespFrame::error("ERR server is shutting down")).await;
                    break;
                }
                read = tokio::time::timeout(idle_timeout, self.framed.next()) => {
                    match read {
                        Ok(Some(Ok(frame))) => frame,
                        Ok(Some(Err(e))) => {
                            if !is_normal_disconnect(&e) {
                                warn!(addr = %self.addr, error = %e, "connection error");
                            }
                            break;
                        }
                        Ok(None) => {
                            debug!(addr = %self.addr, "connection closed by peer");
                            break;
                        }
                        Err(_elapsed) => {
                            debug!(addr = %self.addr, "connection idle, closing");
                            break;
                        }
                    }
                }
            };

            // parsing-args: a connection that sends a malformed command
            // gets an `-ERR` reply and stays open; only I/O failures on
            // the reply itself end the loop.
            let command = match Command::parse(&frame) {
                Ok(command) => command,
                Err(e) => {
                    self.framed.send(RespFrame::error(e.as_resp_error_body())).await?;
                    continue;
                }
            };

            // executing: route first, then dispatch locally or reply
            // MOVED/CROSSSLOT/CLUSTERDOWN without touching the store
            //.
            let reply = match tokio::time::timeout(command_timeout, self.dispatch(command)).await {
                Ok(reply) => reply,
                Err(_elapsed) => {
                    // writing-reply then closing: a timed-out command
                    // closes the connection
                    let _ = self
                        .framed
                        .send(RespFrame::error(HyperCacheError::Timeout.as_resp_error_body()))
                        .await;
                    break;
                }
            };

            // writing-reply, then back to reading-frame.
            self.framed.send(reply).await?;
        }

        Ok(())
    }

    /// Resolves ownership for the command's keys and either executes it
    /// locally or produces the redirect reply, without ever letting the
    /// store see a command it doesn't own.
    async fn dispatch(&self, command: Command) -> RespFrame {
        let keys = command.keys();
        if keys.is_empty() {
            return commands::execute(&self.coordinator.execution_context(), command).await;
        }

        match self.coordinator.router.route_for_keys(&keys) {
            Ok(target) if self.coordinator.router.is_local(&target) => {
                commands::execute(&self.coordinator.execution_context(), command).await
            }
            Ok(target) => RespFrame::error(
                HyperCacheError::Moved {
                    slot: target.slot,
                    addr: target.resp_addr(),
                }
                .as_resp_error_body(),
            ),
            Err(e) => RespFrame::error(e.as_resp_error_body()),
        }
    }
}

/// Non-critical disconnect: the peer went away mid-read, which is the
/// normal way a RESP client closes a connection.
fn is_normal_disconnect(e: &HyperCacheError) -> bool {
    matches!(
        e,
        HyperCacheError::Io(io_err) if matches!(
            io_err.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionAborted
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::cluster::gossip::{ClusterGossip, GossipConfig};
    use crate::core::cluster::membership::{Node, NodeCapabilities, NodeStatus};
    use crate::core::cluster::routing::Router;
    use crate::core::events::EventBus;
    use crate::core::persistence::{Persistence, PersistenceConfig, SyncPolicy};
    use crate::core::storage::{EvictionPolicyKind, Store, StoreConfig};
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};
    use tokio::net::{TcpListener, TcpStream};

    async fn test_coordinator(tmp: &tempfile::TempDir, gossip_port: u16) -> Arc<Coordinator> {
        let store = Arc::new(Store::new(
            "main",
            StoreConfig {
                max_memory_bytes: 64 * 1024 * 1024,
                default_ttl: None,
                eviction_policy: EvictionPolicyKind::Lru,
                filter_capacity: 1024,
                filter_false_positive_rate: 0.01,
            },
        ));
        let persistence = Arc::new(
            Persistence::open(
                PersistenceConfig {
                    data_dir: tmp.path().to_path_buf(),
                    sync_policy: SyncPolicy::Never,
                    max_log_size: 1024 * 1024,
                    retain_logs: 2,
                    compression_level: 0,
                    enabled: true,
                },
                &store,
            )
            .await
            .unwrap(),
        );
        let gossip_addr: SocketAddr = format!("127.0.0.1:{gossip_port}").parse().unwrap();
        let local_node = Node {
            node_id: "a".to_string(),
            address: "127.0.0.1".to_string(),
            gossip_port,
            resp_port: 6379,
            status: NodeStatus::Alive,
            load: 0.0,
            last_seen: Instant::now(),
            capabilities: NodeCapabilities::empty(),
            metadata: HashMap::new(),
        };
        let gossip = ClusterGossip::bind(
            local_node,
            GossipConfig {
                bind_addr: gossip_addr,
                heartbeat_interval: Duration::from_millis(50),
                failure_detection_timeout: Duration::from_secs(5),
                reap_after: Duration::from_secs(60),
                cluster_secret: b"test-secret".to_vec(),
            },
        )
        .await
        .unwrap();
        let event_bus = EventBus::new("a".to_string(), Arc::clone(&gossip));
        let router = Arc::new(Router::new("a".to_string()));
        router.rebuild(&gossip.membership().snapshot());
        Coordinator::for_test("a".to_string(), Arc::new(Config::default()), store, persistence, router, gossip, event_bus)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(&tmp, 18901).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let _ = ConnectionHandler::new(stream, peer, accept_coordinator).run().await;
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(client, RespCodec);

        framed
            .send(RespFrame::Array(vec![
                RespFrame::bulk("SET"),
                RespFrame::bulk("key1"),
                RespFrame::bulk("value1"),
            ]))
            .await
            .unwrap();
        assert_eq!(framed.next().await.unwrap().unwrap(), RespFrame::ok());

        framed
            .send(RespFrame::Array(vec![RespFrame::bulk("GET"), RespFrame::bulk("key1")]))
            .await
            .unwrap();
        assert_eq!(framed.next().await.unwrap().unwrap(), RespFrame::bulk("value1"));
    }

    #[tokio::test]
    async fn unknown_command_replies_err_and_stays_open() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(&tmp, 18902).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let _ = ConnectionHandler::new(stream, peer, coordinator).run().await;
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(client, RespCodec);
        framed
            .send(RespFrame::Array(vec![RespFrame::bulk("FROBNICATE")]))
            .await
            .unwrap();
        match framed.next().await.unwrap().unwrap() {
            RespFrame::Error(msg) => assert!(msg.contains("unknown command")),
            other => panic!("expected error frame, got {other:?}"),
        }

        framed
            .send(RespFrame::Array(vec![RespFrame::bulk("PING")]))
            .await
            .unwrap();
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            RespFrame::SimpleString("PONG".to_string())
        );
    }
}
