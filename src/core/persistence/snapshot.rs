// src/core/persistence/snapshot.rs

//! Point-in-time snapshots (, §4.5): a consistent image
//! of the store plus the log sequence the snapshot was taken at, written
//! atomically so a crash mid-write never produces a candidate for recovery.
//!
//! Grounded on the teacher's `core/persistence/spldb_saver.rs`/`spldb.rs`
//! (write-to-temp-file, checksum, atomic rename pattern for its own
//! point-in-time dump format), adapted to exact sequence:
//! "write to a temp file, fsync, rename into place, fsync the directory."

use crate::core::errors::HyperCacheError;
use crate::core::storage::Entry;
use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// `{epoch, created_at, entries[]}` plus the log sequence referenced by
/// ("a reference to the log sequence at which it was taken").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub epoch: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub log_sequence: u64,
    pub entries: Vec<Entry>,
}

/// One row of the snapshot index file: `{epoch, sequence, created_at, path}`
///. The newest valid entry is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotIndexEntry {
    pub epoch: u64,
    pub log_sequence: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub file_name: String,
}

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

/// Writes `snapshot` to `dir` using the write-temp/fsync/rename/fsync-dir
/// sequence from, optionally zstd-compressed at `compression_level`
/// (`0` disables compression). Returns the file name written, to be
/// recorded in the index.
pub async fn write_snapshot(
    dir: &Path,
    snapshot: &Snapshot,
    compression_level: i32,
) -> Result<String, HyperCacheError> {
    fs::create_dir_all(dir).await?;
    let file_name = format!("{:020}-{:020}.snap", snapshot.epoch, snapshot.log_sequence);
    let final_path = dir.join(&file_name);
    let tmp_path = dir.join(format!("{file_name}.tmp"));

    let raw = bincode::serde::encode_to_vec(snapshot, bincode_config())
        .map_err(|e| HyperCacheError::Encode(e.to_string()))?;
    let body = if compression_level > 0 {
        zstd::encode_all(raw.as_slice(), compression_level)
            .map_err(|e| HyperCacheError::Encode(format!("zstd compression failed: {e}")))?
    } else {
        raw
    };
    let checksum = CRC32.checksum(&body);

    {
        let compressed_flag: i32 = if compression_level > 0 { 1 } else { 0 };
        let mut file = File::create(&tmp_path).await?;
        file.write_all(&compressed_flag.to_le_bytes()).await?;
        file.write_all(&checksum.to_le_bytes()).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
    }

    fs::rename(&tmp_path, &final_path).await?;
    // Fsync the directory entry so the rename itself is durable.
    if let Ok(dir_file) = File::open(dir).await {
        let _ = dir_file.sync_all().await;
    }

    info!(path = %final_path.display(), entries = snapshot.entries.len(), "wrote snapshot");
    Ok(file_name)
}

/// Reads and checksum-verifies a snapshot file. A failing checksum returns
/// `Ok(None)` rather than an error so the caller (recovery) can fall back
/// to the previous valid snapshot.
pub async fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, HyperCacheError> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut header = [0u8; 8];
    if file.read_exact(&mut header).await.is_err() {
        warn!(path = %path.display(), "snapshot file too short to contain a header");
        return Ok(None);
    }
    let compressed = header[0..4] != [0, 0, 0, 0];
    let expected_checksum = u32::from_le_bytes(header[4..8].try_into().unwrap());

    let mut body = Vec::new();
    file.read_to_end(&mut body).await?;
    let actual_checksum = CRC32.checksum(&body);
    if actual_checksum != expected_checksum {
        warn!(path = %path.display(), "snapshot failed checksum verification; skipping");
        return Ok(None);
    }

    let raw = if compressed {
        match zstd::decode_all(body.as_slice()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "snapshot failed to decompress; skipping");
                return Ok(None);
            }
        }
    } else {
        body
    };

    match bincode::serde::decode_from_slice::<Snapshot, _>(&raw, bincode_config()) {
        Ok((snapshot, _)) => Ok(Some(snapshot)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "snapshot failed to decode; skipping");
            Ok(None)
        }
    }
}

pub async fn load_index(dir: &Path) -> Result<Vec<SnapshotIndexEntry>, HyperCacheError> {
    let path = dir.join("index.json");
    match fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| HyperCacheError::Decode(format!("snapshot index corrupt: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub async fn append_index(
    dir: &Path,
    entry: SnapshotIndexEntry,
) -> Result<(), HyperCacheError> {
    let mut index = load_index(dir).await?;
    index.push(entry);
    let path = dir.join("index.json");
    let tmp_path = dir.join("index.json.tmp");
    let body = serde_json::to_vec_pretty(&index)
        .map_err(|e| HyperCacheError::Encode(e.to_string()))?;
    fs::write(&tmp_path, body).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(())
}

/// Returns the newest index entry whose file still verifies, trying older
/// entries on checksum failure.
pub async fn newest_valid_snapshot(dir: &Path) -> Result<Option<(SnapshotIndexEntry, Snapshot)>, HyperCacheError> {
    let mut index = load_index(dir).await?;
    index.sort_by_key(|e| (e.epoch, e.log_sequence));
    while let Some(entry) = index.pop() {
        let path = dir.join(&entry.file_name);
        if let Some(snapshot) = read_snapshot(&path).await? {
            return Ok(Some((entry, snapshot)));
        }
    }
    Ok(None)
}

pub fn snapshot_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("snapshots")
}
