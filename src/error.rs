//! Error taxonomy for the block store.
//!
//! One flat enum covers every operational failure the store can surface.
//! Codec errors propagate directly; scan errors are absorbed locally and
//! counted (see `ManagerStats`) rather than raised here.

use std::io;
use thiserror::Error;

/// Why a block's envelope failed to frame correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// Header or footer magic did not match the expected constant.
    Magic,
    /// A length field held an impossible value (e.g. payload > i32::MAX).
    Length,
    /// Fewer bytes were available than the header's declared total length.
    Truncated,
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::Magic => write!(f, "magic mismatch"),
            FramingError::Length => write!(f, "impossible length"),
            FramingError::Truncated => write!(f, "truncated stream"),
        }
    }
}

/// Which of the block's two checksums failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumError {
    Header,
    Payload,
}

impl std::fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumError::Header => write!(f, "header CRC-32 mismatch"),
            ChecksumError::Payload => write!(f, "payload CRC-32 mismatch"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("framing error: {0}")]
    Framing(FramingError),

    #[error("checksum error: {0}")]
    Checksum(ChecksumError),

    #[error("no block with id {0}")]
    NotFound(i64),

    #[error("unsupported payload encoding byte {0}")]
    UnsupportedEncoding(u8),

    #[error("unsupported block kind byte {0}")]
    UnsupportedKind(u8),

    #[error("payload length {0} exceeds the 2^31-1 limit")]
    PayloadTooLarge(u64),

    #[error("write attempted on a read-only manager")]
    PermissionError,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BlockError>;
