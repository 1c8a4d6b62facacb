//! # mailvault — append-only, content-addressed block store
//!
//! Format guarantees:
//! - All numeric fields are little-endian; never negotiated.
//! - Every block is self-describing: magic, version, kind, flags,
//!   payload encoding, dual CRC-32 checksums. Corrupt headers abort that
//!   one read; they never propagate into a seek or an allocation sized
//!   from their own fields.
//! - There is no global header at offset 0 — the first byte of the file
//!   is the first block's header magic. The index is always rebuilt by
//!   scanning forward, never trusted from a side-file.
//! - Block ids are caller-assigned; the latest offset for a given id
//!   wins. Nothing in this crate ever mutates bytes that are already on
//!   disk — updates, checkpoints, and cleanup records are all new blocks
//!   appended after it.
//! - A SHA-256 hash chain links every appended block to the one before
//!   it, so tampering with historical bytes is detectable independent of
//!   the per-block CRCs, which only catch accidental corruption.

pub mod batch;
pub mod block;
pub mod cancel;
pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod hash_chain;
pub mod manager;
pub mod perf;
pub mod serializer;

pub use batch::{build_batch_block, decode_batch, encode_batch, BatchPacker, BatchPolicy, DecodedBatch};
pub use block::{Block, BlockKind, PayloadEncoding, BLOCK_OVERHEAD, FORMAT_VERSION};
pub use cancel::CancelToken;
pub use checkpoint::{CheckpointCriteria, CheckpointManager, CheckpointRecord, DEFAULT_MAX_PER_TARGET};
pub use codec::{get_codec, Algorithm, Codec, CodecError};
pub use error::{BlockError, ChecksumError, FramingError, Result};
pub use hash_chain::{
    to_hex, verify_proof, ChainIntegrity, ChainReport, HashChain, HashChainEntry, Proof, VerificationReport,
};
pub use manager::{BlockManager, BlockLocation, ManagerOptions, Mode, StatsSnapshot};
