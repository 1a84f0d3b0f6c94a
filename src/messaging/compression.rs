//! # Payload Compression
//!
//! Bodies of [`MIN_COMPRESSIBLE_LEN`] bytes or more are LZ4 compressed and
//! tagged with the [`ENCODING_LZ4`] content encoding. Smaller bodies are
//! sent as is. The consumer decompresses only when the tag is present.

use crate::constants::{ENCODING_LZ4, MIN_COMPRESSIBLE_LEN};
use crate::error::{ConveyorError, Result};

/// Upper bound on how much a single LZ4 byte can expand
const MAX_EXPANSION_RATIO: usize = 255;

/// Size-threshold LZ4 compressor used on both ends of the wire
#[derive(Debug, Clone, Copy, Default)]
pub struct Compressor;

impl Compressor {
    pub fn new() -> Self {
        Self
    }

    /// Content-encoding tag written on compressed bodies
    pub fn encoding(&self) -> &'static str {
        ENCODING_LZ4
    }

    pub fn should_compress(&self, payload: &[u8]) -> bool {
        payload.len() >= MIN_COMPRESSIBLE_LEN
    }

    /// Compress with the uncompressed length prepended
    pub fn compress(&self, payload: &[u8]) -> Vec<u8> {
        lz4_flex::compress_prepend_size(payload)
    }

    /// Inverse of [`Compressor::compress`]; malformed input yields `CorruptPayload`
    pub fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>> {
        let declared = Self::declared_len(compressed)?;
        let body_len = compressed.len() - 4;
        if declared > body_len.saturating_mul(MAX_EXPANSION_RATIO) {
            return Err(ConveyorError::corrupt_payload(format!(
                "declared size {declared} is implausible for {body_len} compressed bytes"
            )));
        }

        lz4_flex::decompress_size_prepended(compressed)
            .map_err(|e| ConveyorError::corrupt_payload(format!("LZ4 decompression failed: {e}")))
    }

    fn declared_len(compressed: &[u8]) -> Result<usize> {
        match compressed.get(..4) {
            Some(prefix) => Ok(u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize),
            None => Err(ConveyorError::corrupt_payload(
                "compressed body shorter than its size prefix",
            )),
        }
    }

    /// True when `content_encoding` marks a body this compressor produced
    pub fn is_compressed(&self, content_encoding: Option<&str>) -> bool {
        content_encoding == Some(ENCODING_LZ4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn test_threshold_boundary() {
        let compressor = Compressor::new();
        assert!(!compressor.should_compress(&[]));
        assert!(!compressor.should_compress(&[0u8; 100]));
        assert!(compressor.should_compress(&[0u8; 101]));
    }

    #[test]
    fn test_malformed_input_is_corrupt_payload() {
        let compressor = Compressor::new();
        // declares a 4 GiB body with no data behind it
        let err = compressor.decompress(&[0xff, 0xff, 0xff, 0xff, 0x10]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptPayload);

        let err = compressor.decompress(&[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptPayload);
    }

    #[test]
    fn test_encoding_tag_detection() {
        let compressor = Compressor::new();
        assert!(compressor.is_compressed(Some("lz4")));
        assert!(!compressor.is_compressed(Some("gzip")));
        assert!(!compressor.is_compressed(None));
    }

    #[test]
    fn test_repetitive_json_shrinks() {
        let compressor = Compressor::new();
        let body = br#"{"name":"add","args":[1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1]}"#;
        assert!(compressor.compress(body).len() < body.len());
    }

    proptest! {
        #[test]
        fn prop_compress_round_trips(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let compressor = Compressor::new();
            let restored = compressor.decompress(&compressor.compress(&payload)).unwrap();
            prop_assert_eq!(restored, payload);
        }

        #[test]
        fn prop_threshold_is_monotonic(small in 0usize..2048, extra in 0usize..2048) {
            let compressor = Compressor::new();
            let shorter = vec![b'x'; small];
            let longer = vec![b'x'; small + extra];
            if compressor.should_compress(&shorter) {
                prop_assert!(compressor.should_compress(&longer));
            }
        }

        #[test]
        fn prop_garbage_never_panics(garbage in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = Compressor::new().decompress(&garbage);
        }
    }
}
