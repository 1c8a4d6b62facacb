//! Block format — self-describing, dual-checksummed, append-only record.
//!
//! # On-disk layout (61 bytes fixed overhead, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   header magic     = b"EMDBHEAD"
//!    8      2   version          = 1                  (LE u16)
//!   10      1   kind                                  (u8)
//!   11      1   flags                                 (u8)
//!   12      1   payload_encoding                       (u8)
//!   13      8   timestamp                              (LE i64)
//!   21      8   block_id                                (LE i64)
//!   29      8   payload length L (must fit in i32)      (LE u64)
//!   37      4   header_crc32     CRC32([0..37])  ← LAST  (LE u32)
//!   41      L   payload
//! 41+L      4   payload_crc32    CRC32(payload), 0 if L=0
//! 45+L      8   footer magic     = b"EMDBFOOT"
//! 53+L      8   total block length in bytes, = 61 + L    (LE u64)
//! ```
//!
//! # Checksums
//! `header_crc32` covers bytes `[0..37)` and is verified before anything
//! else is trusted — a corrupt header must never drive a seek or an
//! allocation sized from its own fields. `payload_crc32` is verified
//! after the payload has been read; an empty payload carries an all-zero
//! checksum field rather than the CRC-32 of the empty string.
//!
//! # Index reconstruction
//! Every block is independently self-describing: the total-length field
//! at the very end lets a scanner resuming after a corrupt region know
//! exactly where it would have landed, and the header magic at the start
//! of the next candidate is what the scanner actually searches for (see
//! `manager::scan`).

use crate::error::{BlockError, ChecksumError, FramingError, Result};
use crc32fast::Hasher;
use std::io::{self, Read, Write};

// ── Constants ────────────────────────────────────────────────────────────────

pub const HEADER_MAGIC: [u8; 8] = *b"EMDBHEAD";
pub const FOOTER_MAGIC: [u8; 8] = *b"EMDBFOOT";

/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

/// Fixed byte overhead of every block: 37-byte header body + 4-byte header
/// CRC + 4-byte payload CRC + 16-byte footer (8 magic + 8 total length).
pub const BLOCK_OVERHEAD: u64 = 61;

const HEADER_BODY_SIZE: usize = 37;

/// Largest payload length the codec will encode (2^31 - 1 bytes).
pub const MAX_PAYLOAD_LEN: u64 = i32::MAX as u64;

// ── Flags ────────────────────────────────────────────────────────────────────

pub const FLAG_UPDATE_MARKER: u8 = 0x10;
pub const FLAG_BATCH: u8 = 0x20;
pub const FLAG_SMART_BATCH: u8 = 0x21;
pub const FLAG_COMPRESSED_BATCH: u8 = 0x22;

// ── BlockKind ────────────────────────────────────────────────────────────────

/// Closed enumeration of block roles, with an `Unknown` escape hatch so
/// unrecognised kind bytes still round-trip byte-for-byte instead of
/// being rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Header,
    Metadata,
    Wal,
    FolderTree,
    Folder,
    FolderEnvelope,
    Segment,
    EmailBatch,
    ZoneTreeSegmentKv,
    ZoneTreeSegmentVector,
    Cleanup,
    Checkpoint,
    HashChain,
    /// Any byte value not named above. Carried through unchanged.
    Unknown(u8),
}

impl BlockKind {
    pub fn to_u8(self) -> u8 {
        match self {
            BlockKind::Header => 0,
            BlockKind::Metadata => 1,
            BlockKind::Wal => 2,
            BlockKind::FolderTree => 3,
            BlockKind::Folder => 4,
            BlockKind::FolderEnvelope => 5,
            BlockKind::Segment => 6,
            BlockKind::EmailBatch => 7,
            BlockKind::ZoneTreeSegmentKv => 8,
            BlockKind::ZoneTreeSegmentVector => 9,
            BlockKind::Cleanup => 10,
            BlockKind::Checkpoint => 11,
            BlockKind::HashChain => 12,
            BlockKind::Unknown(b) => b,
        }
    }

    pub fn from_u8(b: u8) -> Self {
        match b {
            0 => BlockKind::Header,
            1 => BlockKind::Metadata,
            2 => BlockKind::Wal,
            3 => BlockKind::FolderTree,
            4 => BlockKind::Folder,
            5 => BlockKind::FolderEnvelope,
            6 => BlockKind::Segment,
            7 => BlockKind::EmailBatch,
            8 => BlockKind::ZoneTreeSegmentKv,
            9 => BlockKind::ZoneTreeSegmentVector,
            10 => BlockKind::Cleanup,
            11 => BlockKind::Checkpoint,
            12 => BlockKind::HashChain,
            other => BlockKind::Unknown(other),
        }
    }
}

// ── PayloadEncoding ──────────────────────────────────────────────────────────

/// Stable byte enum. Authoritative in the sense that callers
/// are expected to honor it — but the block codec itself never refuses
/// to frame or checksum a block over an encoding byte it doesn't
/// recognise; only code that tries to *interpret* the payload (e.g.
/// [`crate::serializer`]) refuses with `UnsupportedEncoding`. This
/// mirrors `BlockKind`'s `Unknown` escape hatch: an unrecognised byte
/// still round-trips byte-for-byte through `encode`/`decode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    None,
    RawBytes,
    Json,
    Protobuf,
    MessagePack,
    Gzip,
    Zstd,
    Brotli,
    Lz4,
    /// Any byte value not named above. Carried through unchanged.
    Unknown(u8),
}

impl PayloadEncoding {
    pub fn to_u8(self) -> u8 {
        match self {
            PayloadEncoding::None => 0,
            PayloadEncoding::RawBytes => 1,
            PayloadEncoding::Json => 2,
            PayloadEncoding::Protobuf => 3,
            PayloadEncoding::MessagePack => 4,
            PayloadEncoding::Gzip => 5,
            PayloadEncoding::Zstd => 6,
            PayloadEncoding::Brotli => 7,
            PayloadEncoding::Lz4 => 8,
            PayloadEncoding::Unknown(b) => b,
        }
    }

    /// Infallible: an unrecognised byte becomes `Unknown(b)` rather than
    /// an error, so the block codec never refuses to decode a block over
    /// its encoding tag alone.
    pub fn from_u8(b: u8) -> Self {
        match b {
            0 => PayloadEncoding::None,
            1 => PayloadEncoding::RawBytes,
            2 => PayloadEncoding::Json,
            3 => PayloadEncoding::Protobuf,
            4 => PayloadEncoding::MessagePack,
            5 => PayloadEncoding::Gzip,
            6 => PayloadEncoding::Zstd,
            7 => PayloadEncoding::Brotli,
            8 => PayloadEncoding::Lz4,
            other => PayloadEncoding::Unknown(other),
        }
    }
}

// ── Block ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub version: u16,
    pub kind: BlockKind,
    pub flags: u8,
    pub payload_encoding: PayloadEncoding,
    pub timestamp: i64,
    pub block_id: i64,
    pub payload: Vec<u8>,
}

impl Block {
    pub fn new(
        kind: BlockKind,
        flags: u8,
        payload_encoding: PayloadEncoding,
        timestamp: i64,
        block_id: i64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            kind,
            flags,
            payload_encoding,
            timestamp,
            block_id,
            payload,
        }
    }

    pub fn is_batch(&self) -> bool {
        self.flags & FLAG_BATCH != 0
    }

    /// Total on-disk footprint this block will occupy once encoded.
    pub fn encoded_len(&self) -> u64 {
        BLOCK_OVERHEAD + self.payload.len() as u64
    }
}

// ── encode / decode ──────────────────────────────────────────────────────────

/// Serialize `block` to its on-disk byte layout.
pub fn encode(block: &Block) -> Result<Vec<u8>> {
    let payload_len = block.payload.len() as u64;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(BlockError::PayloadTooLarge(payload_len));
    }

    let mut out = Vec::with_capacity((BLOCK_OVERHEAD + payload_len) as usize);

    let mut body = [0u8; HEADER_BODY_SIZE];
    body[0..8].copy_from_slice(&HEADER_MAGIC);
    body[8..10].copy_from_slice(&block.version.to_le_bytes());
    body[10] = block.kind.to_u8();
    body[11] = block.flags;
    body[12] = block.payload_encoding.to_u8();
    body[13..21].copy_from_slice(&block.timestamp.to_le_bytes());
    body[21..29].copy_from_slice(&block.block_id.to_le_bytes());
    body[29..37].copy_from_slice(&payload_len.to_le_bytes());

    let mut h = Hasher::new();
    h.update(&body);
    let header_crc = h.finalize();

    out.extend_from_slice(&body);
    out.extend_from_slice(&header_crc.to_le_bytes());
    out.extend_from_slice(&block.payload);

    let payload_crc = if block.payload.is_empty() {
        0u32
    } else {
        let mut h = Hasher::new();
        h.update(&block.payload);
        h.finalize()
    };
    out.extend_from_slice(&payload_crc.to_le_bytes());
    out.extend_from_slice(&FOOTER_MAGIC);
    out.extend_from_slice(&(BLOCK_OVERHEAD + payload_len).to_le_bytes());

    Ok(out)
}

/// Parse and fully validate an encoded block from `bytes`.
///
/// Validation order mirrors the cheapest-check-first discipline: header
/// magic and header CRC before anything payload-sized is touched, then
/// payload CRC, then footer magic, then the trailing total-length field.
pub fn decode(bytes: &[u8]) -> Result<Block> {
    if bytes.len() < HEADER_BODY_SIZE + 4 {
        return Err(BlockError::Framing(FramingError::Truncated));
    }

    let body = &bytes[0..HEADER_BODY_SIZE];
    if body[0..8] != HEADER_MAGIC {
        return Err(BlockError::Framing(FramingError::Magic));
    }

    let stored_header_crc = u32::from_le_bytes(bytes[37..41].try_into().unwrap());
    let mut h = Hasher::new();
    h.update(body);
    if h.finalize() != stored_header_crc {
        return Err(BlockError::Checksum(ChecksumError::Header));
    }

    let version = u16::from_le_bytes(body[8..10].try_into().unwrap());
    let kind = BlockKind::from_u8(body[10]);
    let flags = body[11];
    let payload_encoding = PayloadEncoding::from_u8(body[12]);
    let timestamp = i64::from_le_bytes(body[13..21].try_into().unwrap());
    let block_id = i64::from_le_bytes(body[21..29].try_into().unwrap());
    let payload_len = u64::from_le_bytes(body[29..37].try_into().unwrap());

    if payload_len > MAX_PAYLOAD_LEN {
        return Err(BlockError::Framing(FramingError::Length));
    }
    let payload_len = payload_len as usize;

    let payload_start = 41;
    let payload_end = payload_start + payload_len;
    let footer_start = payload_end + 4;
    let total_len_start = footer_start + 8;
    let total_len_end = total_len_start + 8;

    if bytes.len() < total_len_end {
        return Err(BlockError::Framing(FramingError::Truncated));
    }

    let payload = &bytes[payload_start..payload_end];
    let stored_payload_crc = u32::from_le_bytes(bytes[payload_end..footer_start].try_into().unwrap());
    let expected_payload_crc = if payload.is_empty() {
        0u32
    } else {
        let mut h = Hasher::new();
        h.update(payload);
        h.finalize()
    };
    if stored_payload_crc != expected_payload_crc {
        return Err(BlockError::Checksum(ChecksumError::Payload));
    }

    if bytes[footer_start..total_len_start] != FOOTER_MAGIC {
        return Err(BlockError::Framing(FramingError::Magic));
    }

    let total_len = u64::from_le_bytes(bytes[total_len_start..total_len_end].try_into().unwrap());
    if total_len != BLOCK_OVERHEAD + payload_len as u64 {
        return Err(BlockError::Framing(FramingError::Length));
    }

    Ok(Block {
        version,
        kind,
        flags,
        payload_encoding,
        timestamp,
        block_id,
        payload: payload.to_vec(),
    })
}

/// Write an encoded block directly to `w`, for callers that already hold
/// a writer and want to avoid the intermediate `Vec` copy `encode`
/// allocates internally for the header.
pub fn write<W: Write>(block: &Block, mut w: W) -> io::Result<()> {
    let bytes = encode(block).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    w.write_all(&bytes)
}

/// Read exactly one encoded block from `r`. Reads the 41-byte header
/// first to learn the payload length, then reads payload + trailer.
pub fn read<R: Read>(mut r: R) -> Result<Block> {
    let mut header_buf = [0u8; 41];
    r.read_exact(&mut header_buf)
        .map_err(|e| map_eof(e, FramingError::Truncated))?;

    let payload_len = u64::from_le_bytes(header_buf[29..37].try_into().unwrap());
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(BlockError::Framing(FramingError::Length));
    }
    let payload_len = payload_len as usize;

    let mut rest = vec![0u8; payload_len + 4 + 8 + 8];
    r.read_exact(&mut rest)
        .map_err(|e| map_eof(e, FramingError::Truncated))?;

    let mut full = Vec::with_capacity(header_buf.len() + rest.len());
    full.extend_from_slice(&header_buf);
    full.extend_from_slice(&rest);
    decode(&full)
}

fn map_eof(e: io::Error, fe: FramingError) -> BlockError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        BlockError::Framing(fe)
    } else {
        BlockError::Io(e)
    }
}
