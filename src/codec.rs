//! Compression codec plug-in interface.
//!
//! The block store itself never compresses a caller's payload — that is
//! the external collaborator's job, signalled by `payload_encoding`. The
//! one place *this crate* uses a `Codec` is `batch::BatchPacker`'s
//! `CompressedBatch` mode, where the whole packed payload is compressed
//! before being handed to the block codec. The trait is public so an
//! upstream layer can register its own codec against the same interface
//! instead of being limited to the five built-ins.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
}

/// Runtime discriminant for the five required codec variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    None,
    Gzip,
    Zstd,
    Brotli,
    Lz4,
}

pub trait Codec: Send + Sync {
    fn algorithm(&self) -> Algorithm;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    /// Upper bound on compressed output size for `n` input bytes. Used by
    /// callers that want to pre-allocate rather than let a `Vec` grow.
    fn max_compressed_size(&self, n: usize) -> usize;
}

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn algorithm(&self) -> Algorithm {
        Algorithm::None
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
    fn max_compressed_size(&self, n: usize) -> usize {
        n
    }
}

pub struct GzipCodec {
    pub level: u32,
}
impl Codec for GzipCodec {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Gzip
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;
        let mut enc = GzEncoder::new(Vec::new(), Compression::new(self.level));
        enc.write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        enc.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut out = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
    fn max_compressed_size(&self, n: usize) -> usize {
        n + (n / 1000) + 128
    }
}

pub struct ZstdCodec {
    pub level: i32,
}
impl Codec for ZstdCodec {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Zstd
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, self.level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
    fn max_compressed_size(&self, n: usize) -> usize {
        zstd::zstd_safe::compress_bound(n)
    }
}

pub struct BrotliCodec {
    pub quality: u32,
}
impl Codec for BrotliCodec {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Brotli
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        use std::io::Write;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, self.quality, 22);
            w.write_all(data)
                .map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        use std::io::Read;
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
    fn max_compressed_size(&self, n: usize) -> usize {
        n + (n / 2) + 1024
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Lz4
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
    fn max_compressed_size(&self, n: usize) -> usize {
        n + (n / 255) + 16 + 4
    }
}

pub fn get_codec(alg: Algorithm) -> Box<dyn Codec> {
    match alg {
        Algorithm::None => Box::new(NoneCodec),
        Algorithm::Gzip => Box::new(GzipCodec { level: 6 }),
        Algorithm::Zstd => Box::new(ZstdCodec { level: 3 }),
        Algorithm::Brotli => Box::new(BrotliCodec { quality: 9 }),
        Algorithm::Lz4 => Box::new(Lz4Codec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(c: &dyn Codec, data: &[u8]) {
        let compressed = c.compress(data).unwrap();
        let decompressed = c.decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn all_codecs_round_trip_empty_input() {
        for alg in [Algorithm::None, Algorithm::Gzip, Algorithm::Zstd, Algorithm::Brotli, Algorithm::Lz4] {
            roundtrip(&*get_codec(alg), &[]);
        }
    }

    #[test]
    fn non_none_codecs_compress_repetitive_ascii_below_half() {
        let data = "the quick brown fox jumps over the lazy dog. ".repeat(512);
        let data = data.as_bytes();
        assert!(data.len() >= 10 * 1024);
        for alg in [Algorithm::Gzip, Algorithm::Zstd, Algorithm::Brotli, Algorithm::Lz4] {
            let c = get_codec(alg);
            let compressed = c.compress(data).unwrap();
            assert!(
                (compressed.len() as f64) < (data.len() as f64) * 0.5,
                "{:?} ratio too high: {} / {}",
                alg,
                compressed.len(),
                data.len()
            );
            roundtrip(&*c, data);
        }
    }

    #[test]
    fn non_none_codecs_compress_single_byte_fill_below_tenth() {
        let data = vec![0x41u8; 1024];
        for alg in [Algorithm::Gzip, Algorithm::Zstd, Algorithm::Brotli, Algorithm::Lz4] {
            let c = get_codec(alg);
            let compressed = c.compress(&data).unwrap();
            assert!(
                (compressed.len() as f64) < (data.len() as f64) * 0.1,
                "{:?} ratio too high: {} / {}",
                alg,
                compressed.len(),
                data.len()
            );
        }
    }
}
