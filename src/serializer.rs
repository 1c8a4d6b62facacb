//! Content serializer — a caller-side convenience, not part
//! of the block codec's own contract. `decode_block` never refuses a
//! block because of its `payload_encoding`; only these helpers do, for
//! callers that want typed access to a payload.

use crate::block::PayloadEncoding;
use crate::error::{BlockError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;

/// Serialize `value` using `encoding`. `RawBytes` is a byte-identity
/// passthrough: it requires `T = Vec<u8>` and hands the bytes back
/// unmodified rather than routing them through a codec. Callers passing
/// any other type with `RawBytes` get an `Integrity` error instead of a
/// JSON-shaped encoding of their type.
pub fn serialize<T: Serialize + 'static>(value: &T, encoding: PayloadEncoding) -> Result<Vec<u8>> {
    match encoding {
        PayloadEncoding::Json | PayloadEncoding::None => {
            serde_json::to_vec(value).map_err(|e| BlockError::Integrity(e.to_string()))
        }
        PayloadEncoding::MessagePack => {
            rmp_serde::to_vec(value).map_err(|e| BlockError::Integrity(e.to_string()))
        }
        PayloadEncoding::RawBytes => (value as &dyn Any)
            .downcast_ref::<Vec<u8>>()
            .cloned()
            .ok_or_else(|| BlockError::Integrity("RawBytes encoding requires T = Vec<u8>".into())),
        PayloadEncoding::Protobuf => Err(BlockError::UnsupportedEncoding(encoding.to_u8())),
        other => Err(BlockError::UnsupportedEncoding(other.to_u8())),
    }
}

/// Deserialize bytes previously produced by [`serialize`] with the same
/// `encoding`.
pub fn deserialize<T: DeserializeOwned + 'static>(bytes: &[u8], encoding: PayloadEncoding) -> Result<T> {
    match encoding {
        PayloadEncoding::Json | PayloadEncoding::None => {
            serde_json::from_slice(bytes).map_err(|e| BlockError::Integrity(e.to_string()))
        }
        PayloadEncoding::MessagePack => {
            rmp_serde::from_slice(bytes).map_err(|e| BlockError::Integrity(e.to_string()))
        }
        PayloadEncoding::RawBytes => {
            let owned: Box<dyn Any> = Box::new(bytes.to_vec());
            owned
                .downcast::<T>()
                .map(|boxed| *boxed)
                .map_err(|_| BlockError::Integrity("RawBytes encoding requires T = Vec<u8>".into()))
        }
        PayloadEncoding::Protobuf => Err(BlockError::UnsupportedEncoding(encoding.to_u8())),
        other => Err(BlockError::UnsupportedEncoding(other.to_u8())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        id: u32,
        name: String,
    }

    #[test]
    fn json_round_trip() {
        let s = Sample { id: 1, name: "inbox".into() };
        let bytes = serialize(&s, PayloadEncoding::Json).unwrap();
        let back: Sample = deserialize(&bytes, PayloadEncoding::Json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn messagepack_round_trip() {
        let s = Sample { id: 2, name: "sent".into() };
        let bytes = serialize(&s, PayloadEncoding::MessagePack).unwrap();
        let back: Sample = deserialize(&bytes, PayloadEncoding::MessagePack).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn protobuf_is_unsupported_here() {
        let s = Sample { id: 3, name: "drafts".into() };
        let err = serialize(&s, PayloadEncoding::Protobuf).unwrap_err();
        assert!(matches!(err, BlockError::UnsupportedEncoding(_)));
    }

    #[test]
    fn raw_bytes_is_an_identity_passthrough() {
        let original: Vec<u8> = vec![0x00, 0x01, 0xFF, b'{', b'}', 0x7F];
        let bytes = serialize(&original, PayloadEncoding::RawBytes).unwrap();
        assert_eq!(bytes, original, "RawBytes must not wrap the payload in a JSON array");
        let back: Vec<u8> = deserialize(&bytes, PayloadEncoding::RawBytes).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn raw_bytes_rejects_non_vec_u8_types() {
        let s = Sample { id: 4, name: "trash".into() };
        let err = serialize(&s, PayloadEncoding::RawBytes).unwrap_err();
        assert!(matches!(err, BlockError::Integrity(_)));
    }
}
