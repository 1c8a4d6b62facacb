//! Append-only, indexed block manager.
//!
//! Single file, single writer, many readers. The in-memory
//! `block_id -> BlockLocation` index is the only source of truth for
//! "which offset holds the current version of this id"; it is rebuilt
//! from scratch by [`scan`] whenever a fresh manager is opened.
//!
//! # Concurrency
//! Writers serialize on `writer: Mutex<WriterState>`, which holds the
//! manager's own tracked end-of-file offset — the OS file cursor is
//! never trusted, since every read and write here is a positional
//! (`pread`/`pwrite`) operation addressed by an explicit offset. The
//! index lives behind an `RwLock` so concurrent readers never block each
//! other; only the final insert after a successful write takes the
//! write guard.

use crate::block::{self, Block, BLOCK_OVERHEAD, HEADER_MAGIC};
use crate::cancel::{self, CancelToken};
use crate::error::{BlockError, FramingError, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};

/// Transient pointer into the file: where a block starts and how many
/// bytes (header + payload + footer) it occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub offset: u64,
    pub total_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Writable,
    ReadOnly,
}

/// Configuration accepted at `open()` time. There is no global
/// configuration singleton in this crate — every manager instance is
/// configured independently.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerOptions {
    pub create_if_missing: bool,
}

/// Observable counters for the scan/append path, exposed so callers can
/// tell whether the index they are trusting came out of a clean file or
/// one with skipped corruption.
#[derive(Debug, Default)]
pub struct Stats {
    blocks_indexed: AtomicU64,
    corrupt_regions_skipped: AtomicU64,
    bytes_scanned: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub blocks_indexed: u64,
    pub corrupt_regions_skipped: u64,
    pub bytes_scanned: u64,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            blocks_indexed: self.blocks_indexed.load(Ordering::Relaxed),
            corrupt_regions_skipped: self.corrupt_regions_skipped.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
        }
    }
}

struct WriterState {
    next_offset: u64,
}

/// Result of a full forward scan of the file.
struct ScanResult {
    index: HashMap<i64, BlockLocation>,
    /// Offset one past the last fully-valid block found — where the next
    /// write should land, discarding any unrecoverable trailing bytes.
    valid_end: u64,
    corrupt_regions_skipped: u64,
    bytes_scanned: u64,
}

/// Scan `file` from offset 0, tolerating corruption by byte-skipping
/// until the next header magic is found. Later-offset occurrences of a
/// `block_id` overwrite earlier ones, since append order is the
/// authoritative version order.
fn scan(file: &File) -> io::Result<ScanResult> {
    let file_len = file.metadata()?.len();
    let mut index: HashMap<i64, BlockLocation> = HashMap::new();
    let mut pos: u64 = 0;
    let mut valid_end: u64 = 0;
    let mut corrupt_regions_skipped: u64 = 0;

    while pos + 8 <= file_len {
        let mut magic_probe = [0u8; 8];
        file.read_exact_at(&mut magic_probe, pos)?;
        if magic_probe != HEADER_MAGIC {
            pos += 1;
            continue;
        }

        // Candidate header magic found. Try the 41-byte header first —
        // cheapest validation before committing to a payload-sized read.
        if pos + 41 > file_len {
            break; // trailing partial header; nothing more to scan.
        }
        let mut header_buf = [0u8; 41];
        file.read_exact_at(&mut header_buf, pos)?;

        let payload_len = u64::from_le_bytes(header_buf[29..37].try_into().unwrap());
        if payload_len > block::MAX_PAYLOAD_LEN {
            corrupt_regions_skipped += 1;
            pos += 1;
            continue;
        }

        let total_len = BLOCK_OVERHEAD + payload_len;
        if pos + total_len > file_len {
            // Header looked plausible but the declared payload runs past
            // EOF — a truncated trailing block. Stop; nothing after this
            // is a complete block.
            break;
        }

        let mut full = vec![0u8; total_len as usize];
        file.read_exact_at(&mut full, pos)?;

        match block::decode(&full) {
            Ok(b) => {
                index.insert(b.block_id, BlockLocation { offset: pos, total_length: total_len });
                pos += total_len;
                valid_end = pos;
            }
            Err(_) => {
                // Header magic matched by coincidence, or payload/footer
                // failed validation. Step forward one byte and keep
                // looking for the next real header.
                corrupt_regions_skipped += 1;
                pos += 1;
            }
        }
    }

    Ok(ScanResult {
        index,
        valid_end,
        corrupt_regions_skipped,
        bytes_scanned: file_len,
    })
}

/// A single append-only file plus its in-memory index.
pub struct BlockManager {
    file: File,
    mode: Mode,
    writer: Mutex<WriterState>,
    index: RwLock<HashMap<i64, BlockLocation>>,
    stats: Stats,
}

impl BlockManager {
    /// Open `path`, scanning it to rebuild the index if it already has
    /// content. Pass `ManagerOptions { create_if_missing: true }` to
    /// create an empty file rather than failing when it is absent.
    pub fn open<P: AsRef<Path>>(path: P, mode: Mode, opts: ManagerOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = match mode {
            Mode::Writable => OpenOptions::new()
                .read(true)
                .write(true)
                .create(opts.create_if_missing)
                .open(path)?,
            Mode::ReadOnly => OpenOptions::new().read(true).open(path)?,
        };

        let scanned = scan(&file)?;
        debug!(
            blocks = scanned.index.len(),
            corrupt_regions_skipped = scanned.corrupt_regions_skipped,
            valid_end = scanned.valid_end,
            "opened block manager, index rebuilt by scan"
        );

        if mode == Mode::Writable {
            // Discard any unrecoverable trailing bytes past the last
            // fully-valid block so future appends land cleanly.
            file.set_len(scanned.valid_end)?;
        }

        let stats = Stats::default();
        stats.blocks_indexed.store(scanned.index.len() as u64, Ordering::Relaxed);
        stats
            .corrupt_regions_skipped
            .store(scanned.corrupt_regions_skipped, Ordering::Relaxed);
        stats.bytes_scanned.store(scanned.bytes_scanned, Ordering::Relaxed);

        Ok(Self {
            file,
            mode,
            writer: Mutex::new(WriterState { next_offset: scanned.valid_end }),
            index: RwLock::new(scanned.index),
            stats,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Append `block`, update the index, and return its location.
    pub fn write_block(&self, block: &Block, cancel: Option<&CancelToken>) -> Result<BlockLocation> {
        if self.mode == Mode::ReadOnly {
            return Err(BlockError::PermissionError);
        }
        cancel::check(cancel)?;

        let encoded = block::encode(block)?;
        let total_length = encoded.len() as u64;

        let mut writer = self.writer.lock().expect("writer mutex poisoned");
        let offset = writer.next_offset;

        cancel::check(cancel)?;
        self.file.write_all_at(&encoded, offset)?;
        writer.next_offset = offset + total_length;
        drop(writer);

        let location = BlockLocation { offset, total_length };
        self.index.write().expect("index lock poisoned").insert(block.block_id, location);
        self.stats.blocks_indexed.fetch_add(1, Ordering::Relaxed);

        trace!(block_id = block.block_id, offset, total_length, "wrote block");
        Ok(location)
    }

    /// Look up `block_id`'s current location, then read and decode it.
    pub fn read_block(&self, block_id: i64, cancel: Option<&CancelToken>) -> Result<Block> {
        cancel::check(cancel)?;
        let location = self.location_of(block_id)?;
        self.read_at_location(location, cancel)
    }

    pub fn location_of(&self, block_id: i64) -> Result<BlockLocation> {
        self.index
            .read()
            .expect("index lock poisoned")
            .get(&block_id)
            .copied()
            .ok_or(BlockError::NotFound(block_id))
    }

    pub fn read_at_location(&self, location: BlockLocation, cancel: Option<&CancelToken>) -> Result<Block> {
        cancel::check(cancel)?;
        let file_len = self.file.metadata()?.len();
        if location.offset + location.total_length > file_len {
            return Err(BlockError::Framing(FramingError::Truncated));
        }
        let mut buf = vec![0u8; location.total_length as usize];
        self.file.read_exact_at(&mut buf, location.offset)?;
        cancel::check(cancel)?;
        match block::decode(&buf) {
            Ok(b) => Ok(b),
            Err(e) => {
                warn!(block_id_hint = ?location, error = %e, "read_block decode failed");
                Err(e)
            }
        }
    }

    /// Rebuild the location list from scratch by rescanning the file,
    /// returned in offset order. Does not mutate the live index.
    pub fn scan_file(&self) -> Result<Vec<BlockLocation>> {
        let scanned = scan(&self.file)?;
        let mut locations: Vec<BlockLocation> = scanned.index.into_values().collect();
        locations.sort_by_key(|l| l.offset);
        Ok(locations)
    }

    pub fn get_block_locations(&self) -> HashMap<i64, BlockLocation> {
        self.index.read().expect("index lock poisoned").clone()
    }

    /// Flush and release the file. Consumes `self`, matching the
    /// Open -> Closed transition: there is no way to call any other
    /// operation on a manager after this.
    pub fn close(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
