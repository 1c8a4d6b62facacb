//! Performance utilities: parallel chunk compression and write-buffer
//! batching.
//!
//! # Parallel compression
//!
//! [`compress_chunks_parallel`] compresses a slice of independent data
//! chunks concurrently using Rayon when the `parallel` feature is
//! enabled, falling back to sequential compression otherwise. Each chunk
//! is compressed independently, so the ratio is slightly worse than one
//! solid block, but throughput scales with available cores — useful when
//! packing many small batch entries at once.
//!
//! # Write buffer
//!
//! [`WriteBuffer`] accumulates small writes into a fixed-capacity buffer
//! and flushes to the underlying writer in large aligned chunks, cutting
//! down the number of `write` syscalls for workloads that append many
//! small blocks in a row.

use crate::codec::{self, Algorithm, CodecError};
use sha2::{Digest, Sha256};
use std::io::{self, Write};

// ── Parallel chunk compression ────────────────────────────────────────────

/// A compressed chunk produced by [`compress_chunks_parallel`].
#[derive(Debug)]
pub struct CompressedChunk {
    pub chunk_index: usize,
    /// SHA-256 of the original uncompressed data.
    pub content_hash: [u8; 32],
    pub orig_size: usize,
    pub payload: Vec<u8>,
}

fn compress_one(index: usize, chunk: &[u8], algorithm: Algorithm) -> Result<CompressedChunk, CodecError> {
    let mut hasher = Sha256::new();
    hasher.update(chunk);
    let hash: [u8; 32] = hasher.finalize().into();
    let c = codec::get_codec(algorithm);
    let payload = c.compress(chunk)?;
    Ok(CompressedChunk { chunk_index: index, content_hash: hash, orig_size: chunk.len(), payload })
}

/// Compress `chunks` concurrently, returning one [`CompressedChunk`] per
/// input chunk in the same order. If any chunk fails, the first error is
/// returned and remaining work is abandoned.
pub fn compress_chunks_parallel(chunks: &[&[u8]], algorithm: Algorithm) -> Result<Vec<CompressedChunk>, CodecError> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        chunks
            .par_iter()
            .enumerate()
            .map(|(i, chunk)| compress_one(i, chunk, algorithm))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| compress_one(i, chunk, algorithm))
            .collect()
    }
}

// ── Write buffer ───────────────────────────────────────────────────────────

/// Buffered writer with a configurable flush threshold.
///
/// Accumulates writes up to `capacity` bytes and flushes to the
/// underlying writer once full or on an explicit `flush()`. Unlike
/// `std::io::BufWriter`, this exposes `bytes_written` so callers tracking
/// append-offset bookkeeping (as `BlockManager` does) can observe it
/// directly.
pub struct WriteBuffer<W: Write> {
    inner: W,
    buf: Vec<u8>,
    capacity: usize,
    pub bytes_written: u64,
}

impl<W: Write> WriteBuffer<W> {
    /// `capacity` should be a multiple of the disk sector size (4 KiB minimum).
    pub fn new(inner: W, capacity: usize) -> Self {
        Self { inner, buf: Vec::with_capacity(capacity), capacity, bytes_written: 0 }
    }

    fn flush_if_full(&mut self) -> io::Result<()> {
        if self.buf.len() >= self.capacity {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

impl<W: Write> Write for WriteBuffer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() >= self.capacity {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
            self.inner.write_all(buf)?;
        } else {
            self.buf.extend_from_slice(buf);
            self.flush_if_full()?;
        }
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_buffer_flushes() {
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut wb = WriteBuffer::new(&mut buf, 8);
            wb.write_all(b"hello").unwrap();
            wb.write_all(b" world!").unwrap();
            wb.flush().unwrap();
        }
        assert_eq!(&buf, b"hello world!");
    }

    #[test]
    fn write_buffer_bypasses_for_large_writes() {
        let mut buf: Vec<u8> = Vec::new();
        let mut wb = WriteBuffer::new(&mut buf, 8);
        let big = vec![0x42u8; 100];
        wb.write_all(&big).unwrap();
        wb.flush().unwrap();
        assert_eq!(buf, big);
        assert_eq!(wb.bytes_written, 100);
    }

    #[test]
    fn compress_chunks_parallel_preserves_order_and_round_trips() {
        let a = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        let b = b"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_vec();
        let chunks: Vec<&[u8]> = vec![&a, &b];
        let compressed = compress_chunks_parallel(&chunks, Algorithm::Zstd).unwrap();
        assert_eq!(compressed.len(), 2);
        assert_eq!(compressed[0].chunk_index, 0);
        assert_eq!(compressed[1].chunk_index, 1);
        let codec = codec::get_codec(Algorithm::Zstd);
        assert_eq!(codec.decompress(&compressed[0].payload).unwrap(), a);
    }
}
