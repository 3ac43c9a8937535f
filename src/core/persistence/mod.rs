// src/core/persistence/mod.rs

//! The persistence engine: an append-only log of mutations plus
//! periodic snapshots, giving crash recovery with a bounded replay window.
//! `Persistence` owns the on-disk directory (aof segments, snapshots, the
//! `LOCK` file) exclusively and exposes only `apply`/`iterate` to the rest
//! of the crate.

pub mod aof;
pub mod snapshot;

pub use aof::{LogOp, LogRecord, SyncPolicy, aof_dir};
pub use snapshot::Snapshot;

use crate::core::errors::HyperCacheError;
use crate::core::storage::{Entry, Store};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A held advisory lock on `data_dir/<node_id>/LOCK`, preventing a second
/// process from opening (and thus replaying/writing into) the same
/// directory concurrently (, SPEC_FULL.md §4.5).
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    async fn acquire(dir: &Path) -> Result<Self, HyperCacheError> {
        let path = dir.join("LOCK");
        match tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(DirLock { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(
                HyperCacheError::AlreadyLocked(format!("{} already locked", dir.display())),
            ),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The engine's view of its current append position: the active segment
/// and the next sequence number to assign.
struct LogState {
    segment: Arc<aof::AofSegment>,
    next_sequence: u64,
}

/// Persistence-warning bookkeeping: a failed append/sync does
/// not fail the caller's write, but is logged and counted, surfaced via
/// `INFO persistence`.
#[derive(Default)]
pub struct PersistenceHealth {
    pub append_failures: AtomicU64,
    pub sync_failures: AtomicU64,
}

/// Owns the on-disk state for one node's `Store`. Exclusively
/// owns the log and snapshot files; reaches into `Store` only through
/// `apply`/`iterate`, never holding a reference into it.
pub struct Persistence {
    _lock: DirLock,
    data_dir: PathBuf,
    aof_dir: PathBuf,
    snapshot_dir: PathBuf,
    sync_policy: SyncPolicy,
    max_log_size: u64,
    retain_logs: usize,
    compression_level: i32,
    log: RwLock<LogState>,
    last_snapshot_epoch: AtomicU64,
    pub health: PersistenceHealth,
    enabled: bool,
}

pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    pub sync_policy: SyncPolicy,
    pub max_log_size: u64,
    pub retain_logs: usize,
    pub compression_level: i32,
    pub enabled: bool,
}

impl Persistence {
    /// Opens (creating if absent) the data directory, acquires the `LOCK`
    /// file, and recovers store state three-step sequence.
    /// Recovery happens here, before any network-facing component starts
    /// (SPEC_FULL.md §4.7's concretized startup order).
    pub async fn open(config: PersistenceConfig, store: &Store) -> Result<Self, HyperCacheError> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let lock = DirLock::acquire(&config.data_dir).await?;

        let aof_dir = aof::aof_dir(&config.data_dir);
        let snapshot_dir = snapshot::snapshot_dir(&config.data_dir);

        let recovered_sequence = if config.enabled {
            recover(&aof_dir, &snapshot_dir, store).await?
        } else {
            0
        };

        let segments = aof::list_segments(&aof_dir).await?;
        let segment = match segments.last() {
            Some((start, _)) if config.enabled => {
                Arc::new(aof::AofSegment::create(&aof_dir, *start).await?)
            }
            _ => Arc::new(aof::AofSegment::create(&aof_dir, recovered_sequence + 1).await?),
        };

        Ok(Persistence {
            _lock: lock,
            data_dir: config.data_dir,
            aof_dir,
            snapshot_dir,
            sync_policy: config.sync_policy,
            max_log_size: config.max_log_size,
            retain_logs: config.retain_logs,
            compression_level: config.compression_level,
            log: RwLock::new(LogState {
                segment,
                next_sequence: recovered_sequence + 1,
            }),
            last_snapshot_epoch: AtomicU64::new(0),
            health: PersistenceHealth::default(),
            enabled: config.enabled,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Appends a `SET` record. A failure here is a Persistence-warning (spec
    /// §7): logged and counted, never propagated to the caller, since the
    /// in-memory mutation already succeeded.
    pub async fn log_set(&self, key: &Bytes, value: &Bytes, ttl_seconds: Option<i64>) {
        if !self.enabled {
            return;
        }
        let record = LogRecord {
            sequence: 0,
            timestamp: chrono::Utc::now(),
            op: LogOp::Set,
            key: key.clone(),
            value: Some(value.clone()),
            ttl_seconds,
        };
        self.append(record).await;
    }

    pub async fn log_delete(&self, key: &Bytes) {
        if !self.enabled {
            return;
        }
        let record = LogRecord {
            sequence: 0,
            timestamp: chrono::Utc::now(),
            op: LogOp::Delete,
            key: key.clone(),
            value: None,
            ttl_seconds: None,
        };
        self.append(record).await;
    }

    async fn append(&self, mut record: LogRecord) {
        let segment = {
            let mut state = self.log.write().await;
            record.sequence = state.next_sequence;
            state.next_sequence += 1;
            state.segment.clone()
        };

        if let Err(e) = segment.append(&record).await {
            warn!(error = %e, "AOF append failed; durability compromised for this write");
            self.health.append_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.sync_policy {
            SyncPolicy::Always => {
                if let Err(e) = segment.sync().await {
                    warn!(error = %e, "AOF fsync failed under sync=always");
                    self.health.sync_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            SyncPolicy::Interval | SyncPolicy::Never => {
                let _ = segment.flush().await;
            }
        }

        if segment.size_bytes() >= self.max_log_size {
            self.roll_segment().await;
        }
    }

    async fn roll_segment(&self) {
        let mut state = self.log.write().await;
        let next = state.next_sequence;
        match aof::AofSegment::create(&self.aof_dir, next).await {
            Ok(new_segment) => {
                info!(start_sequence = next, "rolled AOF to new segment");
                state.segment = Arc::new(new_segment);
            }
            Err(e) => warn!(error = %e, "failed to roll AOF segment; continuing with current one"),
        }
    }

    /// Background task driving `sync=interval(T)` fsyncs.
    pub async fn run_interval_syncer(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        if !self.enabled || self.sync_policy != SyncPolicy::Interval {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let segment = self.log.read().await.segment.clone();
                    if let Err(e) = segment.sync().await {
                        warn!(error = %e, "interval AOF sync failed");
                        self.health.sync_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
                _ = shutdown_rx.recv() => return,
            }
        }
    }

    /// Takes a snapshot of `store` at the configured interval,
    /// then compacts log segments predating it (subject to `retain_logs`).
    pub async fn run_snapshotter(
        self: Arc<Self>,
        store: Arc<Store>,
        interval: std::time::Duration,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        if !self.enabled {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.snapshot_now(&store).await {
                        warn!(error = %e, "snapshot failed");
                    }
                }
                _ = shutdown_rx.recv() => return,
            }
        }
    }

    pub async fn snapshot_now(&self, store: &Store) -> Result<(), HyperCacheError> {
        let log_sequence = self.log.read().await.next_sequence.saturating_sub(1);
        let epoch = self.last_snapshot_epoch.fetch_add(1, Ordering::Relaxed) + 1;

        let mut entries = Vec::with_capacity(store.size());
        store.iterate(|e| entries.push(e.clone()));

        let snap = Snapshot {
            epoch,
            created_at: chrono::Utc::now(),
            log_sequence,
            entries,
        };

        let file_name =
            snapshot::write_snapshot(&self.snapshot_dir, &snap, self.compression_level).await?;
        snapshot::append_index(
            &self.snapshot_dir,
            snapshot::SnapshotIndexEntry {
                epoch,
                log_sequence,
                created_at: snap.created_at,
                file_name,
            },
        )
        .await?;

        aof::compact_segments(&self.aof_dir, log_sequence, self.retain_logs).await?;
        Ok(())
    }
}

/// Recovery: load the newest valid snapshot, replay log
/// records past its sequence, then have the caller rebuild the membership
/// filter. Returns the highest sequence replayed (0 if nothing recovered).
async fn recover(
    aof_dir: &Path,
    snapshot_dir: &Path,
    store: &Store,
) -> Result<u64, HyperCacheError> {
    let mut snapshot_sequence = 0u64;

    if let Some((_, snap)) = snapshot::newest_valid_snapshot(snapshot_dir).await? {
        info!(
            epoch = snap.epoch,
            entries = snap.entries.len(),
            "restoring from snapshot"
        );
        for entry in snap.entries {
            let entry: Entry = entry;
            store.restore_entry(entry);
        }
        snapshot_sequence = snap.log_sequence;
    }

    let mut max_sequence = snapshot_sequence;
    let segments = aof::list_segments(aof_dir).await?;
    for (_, path) in segments {
        let store_ref = store;
        let mut local_max = max_sequence;
        aof::replay_segment(&path, snapshot_sequence, |record| {
            local_max = local_max.max(record.sequence);
            apply_record(store_ref, record);
        })
        .await?;
        max_sequence = max_sequence.max(local_max);
    }

    store.rebuild_filter();
    Ok(max_sequence)
}

fn apply_record(store: &Store, record: LogRecord) {
    match record.op {
        LogOp::Set => {
            let ttl = record.ttl_seconds.map(chrono::Duration::seconds);
            let _ = store.set(record.key, record.value.unwrap_or_default(), "recovery", ttl);
        }
        LogOp::Delete => {
            store.delete(&record.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::StoreConfig;
    use bytes::Bytes;

    fn test_store() -> Store {
        Store::new(
            "test",
            StoreConfig {
                max_memory_bytes: 0,
                default_ttl: None,
                eviction_policy: crate::core::storage::EvictionPolicyKind::Lru,
                filter_capacity: 1024,
                filter_false_positive_rate: 0.01,
            },
        )
    }

    #[tokio::test]
    async fn recovery_reproduces_state_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store();

        {
            let persistence = Persistence::open(
                PersistenceConfig {
                    data_dir: dir.path().to_path_buf(),
                    sync_policy: SyncPolicy::Always,
                    max_log_size: 1024 * 1024,
                    retain_logs: 2,
                    compression_level: 0,
                    enabled: true,
                },
                &store,
            )
            .await
            .unwrap();

            for i in 0..50 {
                let key = Bytes::from(format!("key-{i}"));
                let value = Bytes::from(format!("value-{i}"));
                store.set(key.clone(), value.clone(), "client", None).unwrap();
                persistence.log_set(&key, &value, None).await;
            }
            drop(persistence);
        }

        let restored = test_store();
        let recovered_seq = recover(
            &aof::aof_dir(dir.path()),
            &snapshot::snapshot_dir(dir.path()),
            &restored,
        )
        .await
        .unwrap();

        assert_eq!(recovered_seq, 50);
        assert_eq!(restored.size(), 50);
        assert_eq!(restored.get(b"key-0"), Some(Bytes::from_static(b"value-0")));
        assert_eq!(restored.get(b"key-49"), Some(Bytes::from_static(b"value-49")));
    }

    #[tokio::test]
    async fn open_twice_on_same_dir_fails_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store();
        let config = || PersistenceConfig {
            data_dir: dir.path().to_path_buf(),
            sync_policy: SyncPolicy::Never,
            max_log_size: 1024 * 1024,
            retain_logs: 2,
            compression_level: 0,
            enabled: true,
        };
        let first = Persistence::open(config(), &store).await.unwrap();
        let second = Persistence::open(config(), &store).await;
        assert!(second.is_err());
        drop(first);
    }

    #[tokio::test]
    async fn snapshot_then_recovery_drops_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store();
        let persistence = Persistence::open(
            PersistenceConfig {
                data_dir: dir.path().to_path_buf(),
                sync_policy: SyncPolicy::Always,
                max_log_size: 1024 * 1024,
                retain_logs: 2,
                compression_level: 3,
                enabled: true,
            },
            &store,
        )
        .await
        .unwrap();

        store
            .set(
                Bytes::from_static(b"fresh"),
                Bytes::from_static(b"v"),
                "client",
                None,
            )
            .unwrap();
        persistence.log_set(&Bytes::from_static(b"fresh"), &Bytes::from_static(b"v"), None).await;
        persistence.snapshot_now(&store).await.unwrap();

        let restored = test_store();
        recover(
            &aof::aof_dir(dir.path()),
            &snapshot::snapshot_dir(dir.path()),
            &restored,
        )
        .await
        .unwrap();
        assert_eq!(restored.get(b"fresh"), Some(Bytes::from_static(b"v")));
    }
}
