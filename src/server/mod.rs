// src/server/mod.rs

//! The coordinator: wires the store, persistence, routing, and
//! gossip subsystems together, runs the exact startup/shutdown ordering
//! the spec prescribes, and accepts client connections.
//!
//! Grounded on the teacher's `server/mod.rs` (a thin `run()` delegating to
//! `initialization::setup` / `spawner::spawn_all` / `connection_loop::run`)
//! generalized into a single `Coordinator` struct, since HyperCache has far
//! fewer subsystems to wire than the teacher (no TLS, no replica PSYNC
//! handoff, no pub/sub) — one file covers what the teacher splits across
//! `context.rs`/`initialization.rs`/`spawner.rs`/`connection_loop.rs`.

use crate::config::Config;
use crate::connection::ConnectionHandler;
use crate::core::cluster::gossip::{ClusterGossip, GossipConfig};
use crate::core::cluster::membership::{MembershipEventType, Node, NodeStatus};
use crate::core::cluster::routing::Router;
use crate::core::commands::ExecutionContext;
use crate::core::errors::HyperCacheError;
use crate::core::events::EventBus;
use crate::core::persistence::{Persistence, PersistenceConfig};
use crate::core::storage::{Store, StoreConfig, TtlSweeper};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Every subsystem a running node needs, bundled so connection handlers and
/// background tasks can share one handle.
pub struct Coordinator {
    pub config: Arc<Config>,
    pub node_id: String,
    pub store: Arc<Store>,
    pub persistence: Arc<Persistence>,
    pub router: Arc<Router>,
    pub gossip: Arc<ClusterGossip>,
    pub event_bus: Arc<EventBus>,
    pub start_time: Instant,
    /// Live connection count, checked against `server.max_connections`
    /// before a new accept is handed to a `ConnectionHandler` (
    /// "RESP server enforces `max_connections`; excess accepts are closed
    /// immediately"). Shared with every `ConnectionGuard`.
    pub active_connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Coordinator {
    pub fn execution_context(&self) -> ExecutionContext {
        ExecutionContext {
            store: Arc::clone(&self.store),
            persistence: Arc::clone(&self.persistence),
            event_bus: Arc::clone(&self.event_bus),
            router: Arc::clone(&self.router),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
        }
    }

    /// Whether this node should answer to clients at all (
    /// health contract): persistence must not be wedged past recovery, and
    /// the process must not be in a post-shutdown-signal state.
    pub fn is_healthy(&self) -> bool {
        !self.shutdown_tx.is_closed()
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

impl Coordinator {
    /// Assembles a `Coordinator` from already-built subsystems, for tests
    /// (in this crate and in `tests/`) that need a real connection/command
    /// path without going through `server::run`'s full startup sequence
    /// (binding a RESP listener, joining seeds).
    pub fn for_test(
        node_id: String,
        config: Arc<Config>,
        store: Arc<Store>,
        persistence: Arc<Persistence>,
        router: Arc<Router>,
        gossip: Arc<ClusterGossip>,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Coordinator {
            config,
            node_id,
            store,
            persistence,
            router,
            gossip,
            event_bus,
            start_time: Instant::now(),
            active_connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        })
    }
}

/// Builds and runs a node to completion: binds every listener, recovers
/// persisted state, joins the cluster, serves connections, and — on a
/// ctrl-c — tears everything down in reverse order.
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let node_id = config.node.id.clone();

    let store = Arc::new(Store::new(
        "main",
        StoreConfig {
            max_memory_bytes: config
                .cache
                .max_memory
                .resolve()
                .context("resolving cache.max_memory")?,
            default_ttl: config.cache.default_ttl.map(|d| {
                chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
            }),
            eviction_policy: config.cache.eviction_policy,
            filter_capacity: config.cache.filter_capacity_hint,
            filter_false_positive_rate: config.cache.filter_false_positive_rate,
        },
    ));

    let data_dir = config.node_data_dir();
    let persistence = Arc::new(
        Persistence::open(
            PersistenceConfig {
                data_dir: data_dir.clone(),
                sync_policy: config.persistence.sync_policy.into(),
                max_log_size: config.persistence.max_log_size,
                retain_logs: config.persistence.retain_logs,
                compression_level: config.persistence.compression_level,
                enabled: config.persistence.enabled,
            },
            &store,
        )
        .await
        .context("opening persistence engine")?,
    );
    info!(node_id = %node_id, data_dir = %data_dir.display(), "persistence recovered");

    // 1. Membership / gossip binds first — everything else depends on
    // knowing who's in the cluster ( step 1).
    let gossip_bind_addr: SocketAddr = format!("0.0.0.0:{}", config.network.gossip_port)
        .parse()
        .context("parsing gossip bind address")?;
    let local_node = Node {
        node_id: node_id.clone(),
        address: config.network.advertised_host().to_string(),
        gossip_port: config.network.gossip_port,
        resp_port: config.network.resp_port,
        status: NodeStatus::Alive,
        load: 0.0,
        last_seen: Instant::now(),
        capabilities: config.local_capabilities(),
        metadata: HashMap::new(),
    };
    let gossip = ClusterGossip::bind(
        local_node,
        GossipConfig {
            bind_addr: gossip_bind_addr,
            heartbeat_interval: config.cluster.heartbeat_interval,
            failure_detection_timeout: config.cluster.failure_detection_timeout,
            reap_after: config.cluster.reap_after,
            cluster_secret: config.cluster.cluster_secret.clone().into_bytes(),
        },
    )
    .await
    .context("binding gossip socket")?;

    // 2. Event bus rides the gossip transport.
    let event_bus = EventBus::new(node_id.clone(), Arc::clone(&gossip));

    // 3. Router starts with just this node in the slot table.
    let router = Arc::new(Router::with_vnodes(
        node_id.clone(),
        config.cluster.vnodes_per_node,
    ));
    router.rebuild(&gossip.membership().snapshot());

    // 4. RESP listener.
    let resp_bind_addr = format!("{}:{}", config.network.resp_bind_addr, config.network.resp_port);
    let listener = TcpListener::bind(&resp_bind_addr)
        .await
        .with_context(|| format!("binding RESP listener on {resp_bind_addr}"))?;
    info!(addr = %resp_bind_addr, "RESP listener bound");

    // 5. Optional seed join.
    if !config.cluster.seeds.is_empty() {
        let seeds: Vec<SocketAddr> = config
            .cluster
            .seeds
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        gossip.join(&seeds).await.context("joining seed nodes")?;
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let coordinator = Arc::new(Coordinator {
        config: Arc::clone(&config),
        node_id: node_id.clone(),
        store: Arc::clone(&store),
        persistence: Arc::clone(&persistence),
        router: Arc::clone(&router),
        gossip: Arc::clone(&gossip),
        event_bus: Arc::clone(&event_bus),
        start_time: Instant::now(),
        active_connections: Arc::new(AtomicUsize::new(0)),
        shutdown_tx: shutdown_tx.clone(),
    });

    // 6. Background tasks.
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(Arc::clone(&gossip).run(shutdown_tx.subscribe())));
    tasks.push(tokio::spawn(run_membership_bridge(
        Arc::clone(&gossip),
        Arc::clone(&router),
        Arc::clone(&event_bus),
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(
        Arc::clone(&event_bus).run_gossip_bridge(gossip.subscribe_user_events(), shutdown_tx.subscribe()),
    ));
    tasks.push(tokio::spawn(run_replication_apply(
        Arc::clone(&coordinator),
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(
        TtlSweeper::new(Arc::clone(&store), config.cache.cleanup_interval).run(shutdown_tx.subscribe()),
    ));
    tasks.push(tokio::spawn(Arc::clone(&persistence).run_interval_syncer(
        config.persistence.sync_interval,
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(Arc::clone(&persistence).run_snapshotter(
        Arc::clone(&store),
        config.persistence.snapshot_interval,
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(run_load_sampler(
        Arc::clone(&gossip),
        shutdown_tx.subscribe(),
    )));

    let accept_result = accept_loop(listener, Arc::clone(&coordinator)).await;

    // Reverse-order shutdown: announce departure, tell the
    // coordinator's own subscribers, then give background tasks a bounded
    // window to drain before returning.
    event_bus
        .publish_membership_event(&crate::core::cluster::membership::MembershipEvent {
            event_type: MembershipEventType::Left,
            member: gossip.membership().local_node(),
            timestamp: Instant::now(),
        })
        .await;
    gossip.leave().await;
    let _ = shutdown_tx.send(());
    let drain = tokio::time::timeout(Duration::from_secs(5), async {
        for task in tasks {
            let _ = task.await;
        }
    });
    if drain.await.is_err() {
        warn!("background tasks did not drain within the shutdown grace period");
    }

    accept_result
}

async fn accept_loop(listener: TcpListener, coordinator: Arc<Coordinator>) -> Result<()> {
    let mut shutdown_rx = coordinator.subscribe_shutdown();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(()),
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        // back-pressure: "RESP server enforces
                        // `max_connections`; excess accepts are closed
                        // immediately."
                        if coordinator.active_connections.load(Ordering::Relaxed)
                            >= coordinator.config.server.max_connections
                        {
                            warn!(%addr, "max_connections reached, rejecting connection");
                            drop(stream);
                            continue;
                        }
                        let coordinator = Arc::clone(&coordinator);
                        tokio::spawn(async move {
                            if let Err(e) = ConnectionHandler::new(stream, addr, coordinator).run().await {
                                warn!(%addr, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                }
            }
        }
    }
}

/// Rebuilds the slot table on every membership transition and bridges it
/// into the event bus as a `TopologyChanged`/`NodeJoined`/`NodeLeft`/
/// `NodeFailed` notice ( subscription contract feeding §4.1's
/// "a rebuild happens whenever membership changes").
async fn run_membership_bridge(
    gossip: Arc<ClusterGossip>,
    router: Arc<Router>,
    event_bus: Arc<EventBus>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut rx = gossip.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        router.rebuild(&gossip.membership().snapshot());
                        event_bus.publish_membership_event(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "membership bridge lagged; rebuilding from current snapshot");
                        router.rebuild(&gossip.membership().snapshot());
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

/// Subscribes to `DataOperation` events and applies any not originated
/// locally replication-apply path. Loop prevention itself
/// lives in `EventBus::handle_inbound` (origin comparison); this task only
/// ever sees events that already passed that filter plus this node's own
/// (harmlessly re-applied no-op) local writes, which `apply_replicated`
/// filters out by subscribing only to events whose origin differs.
async fn run_replication_apply(coordinator: Arc<Coordinator>, mut shutdown_rx: broadcast::Receiver<()>) {
    use crate::core::events::EventPayload;

    let mut rx = coordinator
        .event_bus
        .subscribe(Some(crate::core::events::ClusterEventType::DataOperation))
        .await;
    let ctx = coordinator.execution_context();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if event.origin_node_id == coordinator.node_id {
                            continue;
                        }
                        if let EventPayload::Data(op) = event.payload {
                            crate::core::commands::apply_replicated(&ctx, op).await;
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

/// Samples CPU load periodically and feeds it into the local node's
/// gossiped `load` field ( `Node.load` "an estimate of this
/// node's current load, used only for observability"). Grounded on the
/// teacher's `config.rs` use of `sysinfo::System` for memory sizing;
/// extended here to the CPU-usage gauge for the same crate's load metric.
async fn run_load_sampler(gossip: Arc<ClusterGossip>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut sys = System::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            _ = ticker.tick() => {
                sys.refresh_cpu_usage();
                let load = sys.global_cpu_usage() as f64 / 100.0;
                gossip.membership().set_local_load(load);
            }
        }
    }
}

pub use crate::core::errors::HyperCacheError as CoordinatorError;
