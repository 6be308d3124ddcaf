//! Envelope codec implementations
//!
//! The engine writes exactly one format to Redis: the JSON-encoded
//! [`ValueEnvelope`](crate::envelope::ValueEnvelope). The codec seam exists
//! so deployments can swap in another self-describing encoding without
//! touching the pipeline.

use crate::envelope::ValueEnvelope;
use crate::error::CacheError;
use crate::traits::Codec;

/// JSON codec using `serde_json`
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &ValueEnvelope) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(envelope).map_err(|e| CacheError::Serialization {
            key: String::new(),
            detail: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<ValueEnvelope, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization {
            key: String::new(),
            detail: e.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "serde_json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_round_trip() {
        let codec = JsonCodec;
        let env = ValueEnvelope::new(json!({"id": 7}), "demo.User", 120, 1_000);
        let bytes = codec.encode(&env).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), env);
    }

    #[test]
    fn garbage_bytes_fail_as_serialization() {
        let codec = JsonCodec;
        let err = codec.decode(b"not-json").unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }

    #[test]
    fn null_marker_survives_the_codec() {
        let codec = JsonCodec;
        let marker = ValueEnvelope::null_marker(60, 0);
        let decoded = codec.decode(&codec.encode(&marker).unwrap()).unwrap();
        assert!(decoded.is_null_marker());
    }
}
