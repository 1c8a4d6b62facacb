//! Batch packer.
//!
//! Splits into two independent concerns: [`BatchPacker`] decides *when*
//! enough pending entries have accumulated to flush, driven by a
//! [`BatchPolicy`]; [`encode_batch`]/[`decode_batch`] define the
//! self-describing wire format a flushed batch is packed into before it
//! becomes a single `Block` payload (`BlockKind::EmailBatch`).
//!
//! # Wire format
//! ```text
//! [header_len: u32 LE]           0 unless a SmartBatch JSON header is present
//! [header bytes]                 present iff header_len > 0
//! [count: u32 LE]
//! repeated `count` times:
//!   [entry_id: i64 LE] [length: u32 LE] [entry bytes]
//! ```
//! A `FLAG_COMPRESSED_BATCH` block wraps the whole thing above behind
//! `[algorithm: u8][uncompressed_len: u32 LE][compressed bytes]` so the
//! inner format never has to know it was compressed.

use crate::block::{Block, BlockKind, PayloadEncoding, FLAG_BATCH, FLAG_COMPRESSED_BATCH, FLAG_SMART_BATCH};
use crate::codec::{self, Algorithm};
use crate::error::{BlockError, Result};
use std::sync::Mutex;

/// The three size tiers `Adaptive` picks from.
const ADAPTIVE_TIERS: [usize; 3] = [512 * 1024, 1024 * 1024, 2 * 1024 * 1024];

/// Governs when [`BatchPacker::offer`] decides a pending batch is ready
/// to flush.
#[derive(Debug, Clone, Copy)]
pub enum BatchPolicy {
    /// Flush as soon as accumulated payload bytes reach `max_bytes`.
    SizeBased { max_bytes: usize },
    /// Flush once the oldest pending entry is `max_age_ms` old.
    TimeBased { max_age_ms: i64 },
    /// Flush on whichever of the two limits trips first.
    Hybrid { max_bytes: usize, max_age_ms: i64 },
    /// Look ahead at the first `lookahead` payloads of a new batch,
    /// average their size, and pick a target from `{512 KiB, 1 MiB,
    /// 2 MiB}` before falling back to ordinary size-based flushing with
    /// that target. Payloads averaging under 1 KiB pick the smallest
    /// tier, under 4 KiB the middle tier, otherwise the largest.
    Adaptive { lookahead: usize },
}

struct PendingState {
    entries: Vec<(i64, Vec<u8>)>,
    total_bytes: usize,
    opened_at: Option<i64>,
    /// Set once `Adaptive` has seen `lookahead` entries and picked a tier.
    adaptive_target: Option<usize>,
}

impl PendingState {
    fn new() -> Self {
        Self { entries: Vec::new(), total_bytes: 0, opened_at: None, adaptive_target: None }
    }

    fn take(&mut self) -> Vec<(i64, Vec<u8>)> {
        self.total_bytes = 0;
        self.opened_at = None;
        self.adaptive_target = None;
        std::mem::take(&mut self.entries)
    }
}

fn adaptive_tier_for_average(avg_payload_size: usize) -> usize {
    if avg_payload_size < 1024 {
        ADAPTIVE_TIERS[0]
    } else if avg_payload_size < 4096 {
        ADAPTIVE_TIERS[1]
    } else {
        ADAPTIVE_TIERS[2]
    }
}

/// Accumulates `(id, bytes)` entries and tells the caller when to flush
/// them into a packed batch, per `policy`.
pub struct BatchPacker {
    policy: BatchPolicy,
    state: Mutex<PendingState>,
}

impl BatchPacker {
    pub fn new(policy: BatchPolicy) -> Self {
        Self { policy, state: Mutex::new(PendingState::new()) }
    }

    /// Offer one entry. Returns the entries to pack now if the policy's
    /// threshold has just been crossed, otherwise `None` (the entry was
    /// absorbed into the pending batch).
    pub fn offer(&self, id: i64, bytes: Vec<u8>, now: i64) -> Option<Vec<(i64, Vec<u8>)>> {
        let mut state = self.state.lock().expect("batch packer mutex poisoned");
        if state.opened_at.is_none() {
            state.opened_at = Some(now);
        }
        state.total_bytes += bytes.len();
        state.entries.push((id, bytes));

        if let BatchPolicy::Adaptive { lookahead } = self.policy {
            if state.adaptive_target.is_none() && state.entries.len() >= lookahead {
                let avg = state.total_bytes / state.entries.len().max(1);
                state.adaptive_target = Some(adaptive_tier_for_average(avg));
            }
        }

        if self.should_flush(&state, now) {
            Some(state.take())
        } else {
            None
        }
    }

    fn should_flush(&self, state: &PendingState, now: i64) -> bool {
        let opened_at = state.opened_at.unwrap_or(now);
        match self.policy {
            BatchPolicy::SizeBased { max_bytes } => state.total_bytes >= max_bytes,
            BatchPolicy::TimeBased { max_age_ms } => now - opened_at >= max_age_ms,
            BatchPolicy::Hybrid { max_bytes, max_age_ms } => {
                state.total_bytes >= max_bytes || now - opened_at >= max_age_ms
            }
            BatchPolicy::Adaptive { .. } => match state.adaptive_target {
                Some(target) => state.total_bytes >= target,
                None => false,
            },
        }
    }

    /// Force-flush whatever is pending regardless of policy thresholds
    /// (used when closing a writer that must not lose buffered entries).
    pub fn flush(&self) -> Vec<(i64, Vec<u8>)> {
        self.state.lock().expect("batch packer mutex poisoned").take()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().expect("batch packer mutex poisoned").entries.len()
    }
}

fn algorithm_to_u8(alg: Algorithm) -> u8 {
    match alg {
        Algorithm::None => 0,
        Algorithm::Gzip => 1,
        Algorithm::Zstd => 2,
        Algorithm::Brotli => 3,
        Algorithm::Lz4 => 4,
    }
}

fn algorithm_from_u8(b: u8) -> Result<Algorithm> {
    Ok(match b {
        0 => Algorithm::None,
        1 => Algorithm::Gzip,
        2 => Algorithm::Zstd,
        3 => Algorithm::Brotli,
        4 => Algorithm::Lz4,
        other => return Err(BlockError::Integrity(format!("unknown batch compression algorithm tag {other}"))),
    })
}

fn encode_inner(entries: &[(i64, Vec<u8>)], smart_header: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    let header_len = smart_header.map_or(0, |h| h.len());
    out.extend_from_slice(&(header_len as u32).to_le_bytes());
    if let Some(h) = smart_header {
        out.extend_from_slice(h);
    }
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (id, bytes) in entries {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

/// Decoded batch contents, ready for the caller to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    pub smart_header: Option<Vec<u8>>,
    pub entries: Vec<(i64, Vec<u8>)>,
}

fn decode_inner(bytes: &[u8]) -> Result<DecodedBatch> {
    if bytes.len() < 4 {
        return Err(BlockError::Integrity("batch payload too short for header length".into()));
    }
    let header_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut pos = 4;
    let smart_header = if header_len > 0 {
        let h = bytes
            .get(pos..pos + header_len)
            .ok_or_else(|| BlockError::Integrity("batch header length exceeds payload".into()))?
            .to_vec();
        pos += header_len;
        Some(h)
    } else {
        None
    };

    let count = u32::from_le_bytes(
        bytes
            .get(pos..pos + 4)
            .ok_or_else(|| BlockError::Integrity("batch payload truncated before entry count".into()))?
            .try_into()
            .unwrap(),
    ) as usize;
    pos += 4;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let id_bytes = bytes
            .get(pos..pos + 8)
            .ok_or_else(|| BlockError::Integrity("batch payload truncated before entry id".into()))?;
        let id = i64::from_le_bytes(id_bytes.try_into().unwrap());
        pos += 8;
        let len = u32::from_le_bytes(
            bytes
                .get(pos..pos + 4)
                .ok_or_else(|| BlockError::Integrity("batch payload truncated before entry length".into()))?
                .try_into()
                .unwrap(),
        ) as usize;
        pos += 4;
        let data = bytes
            .get(pos..pos + len)
            .ok_or_else(|| BlockError::Integrity("batch entry length exceeds payload".into()))?
            .to_vec();
        pos += len;
        entries.push((id, data));
    }

    Ok(DecodedBatch { smart_header, entries })
}

/// Pack `entries` into a single block payload, returning the payload
/// bytes and the flags byte that must be set on the `Block` carrying it.
pub fn encode_batch(
    entries: &[(i64, Vec<u8>)],
    smart_header: Option<&[u8]>,
    compress: Option<Algorithm>,
) -> Result<(Vec<u8>, u8)> {
    let inner = encode_inner(entries, smart_header);

    match compress {
        None => {
            let flags = if smart_header.is_some() { FLAG_SMART_BATCH } else { FLAG_BATCH };
            Ok((inner, flags))
        }
        Some(alg) => {
            let codec = codec::get_codec(alg);
            let compressed = codec
                .compress(&inner)
                .map_err(|e| BlockError::Integrity(e.to_string()))?;
            let mut out = Vec::with_capacity(compressed.len() + 5);
            out.push(algorithm_to_u8(alg));
            out.extend_from_slice(&(inner.len() as u32).to_le_bytes());
            out.extend_from_slice(&compressed);
            Ok((out, FLAG_COMPRESSED_BATCH))
        }
    }
}

/// Inverse of [`encode_batch`]. `flags` must be the batch flag byte the
/// carrying `Block` was written with.
pub fn decode_batch(payload: &[u8], flags: u8) -> Result<DecodedBatch> {
    if flags == FLAG_COMPRESSED_BATCH {
        if payload.len() < 5 {
            return Err(BlockError::Integrity("compressed batch payload too short".into()));
        }
        let alg = algorithm_from_u8(payload[0])?;
        let uncompressed_len = u32::from_le_bytes(payload[1..5].try_into().unwrap()) as usize;
        let codec = codec::get_codec(alg);
        let inner = codec
            .decompress(&payload[5..])
            .map_err(|e| BlockError::Integrity(e.to_string()))?;
        if inner.len() != uncompressed_len {
            return Err(BlockError::Integrity(format!(
                "decompressed batch length {} does not match declared length {}",
                inner.len(),
                uncompressed_len
            )));
        }
        decode_inner(&inner)
    } else {
        decode_inner(payload)
    }
}

/// Convenience: build the full `Block` (kind `EmailBatch`) for a packed
/// batch in one call.
pub fn build_batch_block(
    entries: &[(i64, Vec<u8>)],
    smart_header: Option<&[u8]>,
    compress: Option<Algorithm>,
    timestamp: i64,
    block_id: i64,
) -> Result<Block> {
    let (payload, flags) = encode_batch(entries, smart_header, compress)?;
    Ok(Block::new(BlockKind::EmailBatch, flags, PayloadEncoding::RawBytes, timestamp, block_id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_based_flushes_once_threshold_crossed() {
        let packer = BatchPacker::new(BatchPolicy::SizeBased { max_bytes: 10 });
        assert!(packer.offer(1, vec![0u8; 4], 0).is_none());
        assert!(packer.offer(2, vec![0u8; 4], 0).is_none());
        let flushed = packer.offer(3, vec![0u8; 4], 0).unwrap();
        assert_eq!(flushed.len(), 3);
        assert_eq!(packer.pending_len(), 0);
    }

    #[test]
    fn time_based_flushes_once_age_exceeded() {
        let packer = BatchPacker::new(BatchPolicy::TimeBased { max_age_ms: 1000 });
        assert!(packer.offer(1, vec![1], 0).is_none());
        assert!(packer.offer(2, vec![2], 500).is_none());
        let flushed = packer.offer(3, vec![3], 1500).unwrap();
        assert_eq!(flushed.len(), 3);
    }

    #[test]
    fn adaptive_picks_smallest_tier_for_small_average_payloads() {
        let packer = BatchPacker::new(BatchPolicy::Adaptive { lookahead: 2 });
        // Average well under 1 KiB selects the 512 KiB tier; nothing
        // flushes until that many bytes have actually accumulated.
        assert!(packer.offer(1, vec![0u8; 10], 0).is_none());
        assert!(packer.offer(2, vec![0u8; 10], 0).is_none(), "tier chosen but target not yet reached");
        let mut total = 20usize;
        let mut next_id = 3i64;
        let mut flushed = None;
        while flushed.is_none() {
            total += 4096;
            flushed = packer.offer(next_id, vec![0u8; 4096], 0);
            next_id += 1;
            assert!(total < 10_000_000, "adaptive tier never reached, test runaway");
        }
        assert!(flushed.unwrap().len() >= 2);
    }

    #[test]
    fn adaptive_picks_larger_tier_for_large_average_payloads() {
        let packer = BatchPacker::new(BatchPolicy::Adaptive { lookahead: 2 });
        assert!(packer.offer(1, vec![0u8; 8192], 0).is_none());
        let flushed = packer.offer(2, vec![0u8; 8192], 0);
        // Two 8 KiB entries (16 KiB) are nowhere near the chosen 2 MiB tier.
        assert!(flushed.is_none());
    }

    #[test]
    fn explicit_flush_returns_partial_batch() {
        let packer = BatchPacker::new(BatchPolicy::SizeBased { max_bytes: 1_000_000 });
        packer.offer(1, vec![1, 2, 3], 0);
        let flushed = packer.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(packer.pending_len(), 0);
    }

    #[test]
    fn plain_batch_round_trips() {
        let entries = vec![(1i64, b"hello".to_vec()), (2i64, b"world".to_vec())];
        let (payload, flags) = encode_batch(&entries, None, None).unwrap();
        assert_eq!(flags, FLAG_BATCH);
        let decoded = decode_batch(&payload, flags).unwrap();
        assert_eq!(decoded.smart_header, None);
        assert_eq!(decoded.entries, entries);
    }

    #[test]
    fn smart_batch_round_trips_with_header() {
        let entries = vec![(1i64, b"a".to_vec())];
        let header = br#"{"folder":"inbox"}"#;
        let (payload, flags) = encode_batch(&entries, Some(header), None).unwrap();
        assert_eq!(flags, FLAG_SMART_BATCH);
        let decoded = decode_batch(&payload, flags).unwrap();
        assert_eq!(decoded.smart_header.as_deref(), Some(header.as_ref()));
        assert_eq!(decoded.entries, entries);
    }

    #[test]
    fn compressed_batch_round_trips() {
        let entries: Vec<(i64, Vec<u8>)> = (0..20).map(|i| (i, b"repeated payload bytes ".repeat(20))).collect();
        let (payload, flags) = encode_batch(&entries, None, Some(Algorithm::Zstd)).unwrap();
        assert_eq!(flags, FLAG_COMPRESSED_BATCH);
        let uncompressed_len = encode_inner(&entries, None).len();
        assert!(payload.len() < uncompressed_len, "compressed batch should be smaller");
        let decoded = decode_batch(&payload, flags).unwrap();
        assert_eq!(decoded.entries, entries);
    }

    #[test]
    fn build_batch_block_sets_email_batch_kind() {
        let entries = vec![(1i64, b"x".to_vec())];
        let block = build_batch_block(&entries, None, None, 1000, 42).unwrap();
        assert_eq!(block.kind, BlockKind::EmailBatch);
        assert!(block.is_batch());
        assert_eq!(block.block_id, 42);
    }

    #[test]
    fn truncated_batch_payload_is_rejected() {
        let entries = vec![(1i64, b"hello".to_vec())];
        let (mut payload, flags) = encode_batch(&entries, None, None).unwrap();
        payload.truncate(payload.len() - 2);
        assert!(decode_batch(&payload, flags).is_err());
    }
}
