//! Per-symbol tick file storage.
//!
//! One append-only binary file per symbol at `<base>/<symbol_id>.tick`,
//! created lazily on first write. Contents are a contiguous sequence of
//! 64-byte records in arrival order, no header and no index, so readers can
//! memory-map and stride by 64.

use std::{
    collections::HashMap,
    fmt,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::wire::{MarketMessage, MAX_SYMBOL_ID, MESSAGE_SIZE};

/// Open file handle plus per-file counters.
struct FileHandle {
    writer: BufWriter<File>,
    messages_written: u64,
}

/// Storage stage for validated records.
///
/// The handle map sits behind a short-critical-section mutex: the processor
/// is the only mutator today, but the map must tolerate concurrent readers
/// if storage is ever driven from more than one thread.
pub struct TickStorage {
    base_path: PathBuf,
    files: Mutex<HashMap<u32, FileHandle>>,

    messages_stored: AtomicU64,
    bytes_written: AtomicU64,
    write_errors: AtomicU64,
    write_time_ns: AtomicU64,
}

impl TickStorage {
    /// Create the storage stage, making the base directory if needed.
    /// A directory that cannot be created is fatal at startup.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)
            .with_context(|| format!("failed to create output directory {}", base_path.display()))?;

        Ok(Self {
            base_path,
            files: Mutex::new(HashMap::new()),
            messages_stored: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            write_time_ns: AtomicU64::new(0),
        })
    }

    /// Append one record to its symbol file, flushing the stream buffer.
    ///
    /// An out-of-range symbol id here means the upstream validator is
    /// broken; that is a programmer error, not an I/O condition, and is
    /// reported as `StorageError::InvalidSymbolId` for the caller to treat
    /// as fatal. I/O failures are counted and logged but recoverable.
    pub fn store(&self, msg: &MarketMessage) -> std::result::Result<(), StorageError> {
        if msg.symbol_id == 0 || msg.symbol_id > MAX_SYMBOL_ID {
            return Err(StorageError::InvalidSymbolId(msg.symbol_id));
        }

        let start = Instant::now();
        let mut files = self.files.lock();

        let handle = match files.entry(msg.symbol_id) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let path = self.base_path.join(format!("{}.tick", msg.symbol_id));
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| self.record_write_error(msg.symbol_id, e))?;
                info!(symbol = msg.symbol_id, path = %path.display(), "opened tick file");
                e.insert(FileHandle {
                    writer: BufWriter::new(file),
                    messages_written: 0,
                })
            }
        };

        handle
            .writer
            .write_all(&msg.to_bytes())
            .and_then(|_| handle.writer.flush())
            .map_err(|e| self.record_write_error(msg.symbol_id, e))?;

        handle.messages_written += 1;
        drop(files);

        self.messages_stored.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(MESSAGE_SIZE as u64, Ordering::Relaxed);
        self.write_time_ns
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn record_write_error(&self, symbol_id: u32, e: std::io::Error) -> StorageError {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
        error!(symbol = symbol_id, error = %e, "tick file write failed");
        StorageError::Io(e)
    }

    /// Flush every open handle. Invoked at shutdown and optionally from a
    /// periodic task.
    pub fn flush(&self) {
        let mut files = self.files.lock();
        for (symbol_id, handle) in files.iter_mut() {
            if let Err(e) = handle.writer.flush() {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                error!(symbol = symbol_id, error = %e, "tick file flush failed");
            }
        }
    }

    /// Number of symbol files opened so far.
    pub fn open_files(&self) -> usize {
        self.files.lock().len()
    }

    /// Records written for one symbol, if its file exists.
    pub fn messages_for(&self, symbol_id: u32) -> Option<u64> {
        self.files.lock().get(&symbol_id).map(|h| h.messages_written)
    }

    pub fn stats(&self) -> StorageStatsSnapshot {
        StorageStatsSnapshot {
            messages_stored: self.messages_stored.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            write_time_ns: self.write_time_ns.load(Ordering::Relaxed),
            open_files: self.open_files() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StorageStatsSnapshot {
    pub messages_stored: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
    pub write_time_ns: u64,
    pub open_files: u64,
}

/// Errors from the storage stage.
#[derive(Debug)]
pub enum StorageError {
    /// Symbol id outside 1..=10000; should have failed validation upstream.
    InvalidSymbolId(u32),
    Io(std::io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSymbolId(id) => {
                write!(f, "symbol_id {} outside 1..={}", id, MAX_SYMBOL_ID)
            }
            Self::Io(e) => write!(f, "tick file I/O error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}
