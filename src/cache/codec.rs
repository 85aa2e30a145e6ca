//! Payload encoding: JSON text compressed with gzip

use super::CacheError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::Value;
use std::io::{Read, Write};

/// Serialized payload ready for storage
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub compressed: Vec<u8>,
    /// Size of the uncompressed JSON text
    pub size_bytes: u64,
}

/// Logical size of a value: the length of its serialized JSON, before compression
pub fn calculate_size<T: Serialize + ?Sized>(value: &T) -> Result<u64, CacheError> {
    Ok(serde_json::to_vec(value)?.len() as u64)
}

pub fn encode(value: &Value) -> Result<EncodedPayload, CacheError> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(CacheError::Compression)?;
    let compressed = encoder.finish().map_err(CacheError::Compression)?;
    Ok(EncodedPayload {
        compressed,
        size_bytes: json.len() as u64,
    })
}

pub fn decode(bytes: &[u8]) -> Result<Value, CacheError> {
    let mut json = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut json)
        .map_err(CacheError::Compression)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_size_is_uncompressed() {
        let value = json!({"message": "x".repeat(4096)});
        let encoded = encode(&value).unwrap();
        assert_eq!(encoded.size_bytes, calculate_size(&value).unwrap());
        assert!((encoded.compressed.len() as u64) < encoded.size_bytes);
        assert_eq!(decode(&encoded.compressed).unwrap(), value);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(b"not gzip"),
            Err(CacheError::Compression(_))
        ));
    }
}
