// src/core/persistence/aof.rs

//! The append-only log: one record per successful local
//! `set`/`delete`, size-capped segments, a configurable sync policy, and
//! checksum-guarded recovery.
//!
//! Grounded on the teacher's `core/persistence/aof_writer.rs` (a
//! single-writer background task buffering appends behind a channel and
//! driving `fsync` off a policy-specific timer/signal) and
//! `core/persistence/aof_loader.rs` (sequential replay stopping at the
//! first corrupt record). This crate's log is simpler — one op per record,
//! no Lua/transaction framing — but keeps the same record shape: a length
//! prefix, a checksum, and a bincode-encoded payload, so a truncated or
//! bit-flipped tail is detectable without parsing past it.

use crate::core::errors::HyperCacheError;
use bytes::Bytes;
use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, warn};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The sync policy a log writer runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    Always,
    #[default]
    Interval,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    Set,
    Delete,
}

/// `{sequence, timestamp, op, key, value?, ttl?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub sequence: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub op: LogOp,
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub ttl_seconds: Option<i64>,
}

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

fn encode_record(record: &LogRecord) -> Result<Vec<u8>, HyperCacheError> {
    bincode::serde::encode_to_vec(record, bincode_config())
        .map_err(|e| HyperCacheError::Encode(e.to_string()))
}

fn decode_record(bytes: &[u8]) -> Result<LogRecord, HyperCacheError> {
    bincode::serde::decode_from_slice(bytes, bincode_config())
        .map(|(record, _)| record)
        .map_err(|e| HyperCacheError::Decode(e.to_string()))
}

/// A single segment file: `sequence.log` under `data_dir/<node_id>/aof/`.
/// File names are monotonic segment start sequences
/// "segment files with monotonic names".
pub struct AofSegment {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    pub start_sequence: u64,
    size_bytes: std::sync::atomic::AtomicU64,
}

impl AofSegment {
    pub async fn create(dir: &Path, start_sequence: u64) -> Result<Self, HyperCacheError> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{start_sequence:020}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(AofSegment {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            start_sequence,
            size_bytes: std::sync::atomic::AtomicU64::new(size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Appends one record: `[len:u32][crc32:u32][payload]`.
    pub async fn append(&self, record: &LogRecord) -> Result<(), HyperCacheError> {
        let payload = encode_record(record)?;
        let checksum = CRC32.checksum(&payload);
        let mut framed = Vec::with_capacity(8 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(&checksum.to_le_bytes());
        framed.extend_from_slice(&payload);

        let mut writer = self.writer.lock().await;
        writer.write_all(&framed).await?;
        self.size_bytes
            .fetch_add(framed.len() as u64, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), HyperCacheError> {
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        Ok(())
    }

    /// Flushes buffered writes and fsyncs, per `sync=always`/`sync=every_interval`.
    pub async fn sync(&self) -> Result<(), HyperCacheError> {
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        writer.get_ref().sync_data().await?;
        Ok(())
    }
}

/// Replays every well-formed record in `path` in order, calling `apply` for
/// each. On a checksum failure or truncated trailing record the log is
/// truncated at that point and replay
/// stops; everything prior has already been applied.
pub async fn replay_segment(
    path: &Path,
    min_sequence: u64,
    mut apply: impl FnMut(LogRecord),
) -> Result<(), HyperCacheError> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut offset: u64 = 0;
    loop {
        let mut header = [0u8; 8];
        match file.read_exact(&mut header).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let expected_checksum = u32::from_le_bytes(header[4..8].try_into().unwrap());

        let mut payload = vec![0u8; len];
        if file.read_exact(&mut payload).await.is_err() {
            warn!(path = %path.display(), %offset, "AOF segment truncated mid-record; stopping replay here");
            truncate_at(&mut file, offset).await?;
            break;
        }

        let actual_checksum = CRC32.checksum(&payload);
        if actual_checksum != expected_checksum {
            warn!(path = %path.display(), %offset, "AOF record failed checksum; truncating log at this point");
            truncate_at(&mut file, offset).await?;
            break;
        }

        match decode_record(&payload) {
            Ok(record) => {
                offset += 8 + len as u64;
                if record.sequence > min_sequence {
                    apply(record);
                }
            }
            Err(e) => {
                warn!(path = %path.display(), %offset, error = %e, "AOF record failed to decode; truncating log at this point");
                truncate_at(&mut file, offset).await?;
                break;
            }
        }
    }
    Ok(())
}

async fn truncate_at(file: &mut File, offset: u64) -> Result<(), HyperCacheError> {
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(())
}

/// The `aof/` subdirectory under a node's data directory, parallel to
/// `snapshot::snapshot_dir`.
pub fn aof_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("aof")
}

/// Lists segment files under `aof/`, sorted by their start sequence.
pub async fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, HyperCacheError> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if let Ok(seq) = stem.parse::<u64>() {
                out.push((seq, path));
            }
        }
    }
    out.sort_by_key(|(seq, _)| *seq);
    Ok(out)
}

/// Deletes segments whose entire sequence range predates `keep_above`,
/// subject to `retain_logs`.
pub async fn compact_segments(
    dir: &Path,
    keep_above: u64,
    retain_logs: usize,
) -> Result<(), HyperCacheError> {
    let mut segments = list_segments(dir).await?;
    if segments.len() <= retain_logs {
        return Ok(());
    }
    segments.sort_by_key(|(seq, _)| *seq);
    let removable = segments.len() - retain_logs;
    for (seq, path) in segments.into_iter().take(removable) {
        if seq < keep_above {
            debug!(path = %path.display(), "compacting old AOF segment after snapshot");
            let _ = fs::remove_file(&path).await;
        }
    }
    Ok(())
}

pub fn default_sync_interval() -> Duration {
    Duration::from_secs(1)
}
