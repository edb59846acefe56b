// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! LZ4 payload compression for server responses.
//!
//! A response body is compressed only when it is longer than the configured
//! threshold and the compressed form actually wins by more than 10%; the
//! `OriginalSize` field on the wire is zero for uncompressed bodies.

use super::error::CodecError;

/// The default body-length threshold below which compression is skipped.
pub const COMPRESSION_THRESHOLD: usize = 512;

/// A payload compression method.
pub trait Compression: Sync {
    /// Compress `body`, or return `None` to keep it uncompressed.
    fn compress_body(body: &[u8]) -> Option<Vec<u8>>;
    /// Decompress `body` into exactly `original_size` bytes.
    fn decompress_body(body: &[u8], original_size: usize) -> Result<Vec<u8>, CodecError>;
}

/// LZ4 block compression, the wire's only compression method.
#[derive(Debug, Copy, Clone)]
pub struct Lz4;

impl Compression for Lz4 {
    fn compress_body(body: &[u8]) -> Option<Vec<u8>> {
        let compressed = lz4_flex::compress(body);
        // Don't use the compressed bytes unless they win by more than 10%.
        if compressed.len() * 10 >= body.len() * 9 {
            return None;
        }
        Some(compressed)
    }

    fn decompress_body(body: &[u8], original_size: usize) -> Result<Vec<u8>, CodecError> {
        let out = lz4_flex::decompress(body, original_size)
            .map_err(|e| CodecError::BadCompression(e.to_string()))?;
        if out.len() != original_size {
            return Err(CodecError::BadCompression(format!(
                "expected {} bytes, got {}",
                original_size,
                out.len()
            )));
        }
        Ok(out)
    }
}

/// The passthrough method.
#[derive(Debug, Copy, Clone)]
pub struct Uncompressed;

impl Compression for Uncompressed {
    fn compress_body(_: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn decompress_body(body: &[u8], _: usize) -> Result<Vec<u8>, CodecError> {
        Ok(body.to_vec())
    }
}

/// Compress `body` if it clears `threshold` and the win-rate gate.
/// Returns `None` when the body should travel uncompressed.
pub(crate) fn maybe_compress(body: &[u8], threshold: usize) -> Option<Vec<u8>> {
    if body.len() <= threshold {
        return None;
    }
    Lz4::compress_body(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_bodies_stay_uncompressed() {
        assert!(maybe_compress(&[0xAA; 512], 512).is_none());
    }

    #[test]
    fn compressible_bodies_round_trip() {
        let body = vec![0xAA; 8192];
        let compressed = maybe_compress(&body, 512).expect("8 KiB of 0xAA must compress");
        assert!(compressed.len() < body.len() * 9 / 10);
        let restored = Lz4::decompress_body(&compressed, body.len()).unwrap();
        assert_eq!(restored, body);
    }

    #[test]
    fn incompressible_bodies_stay_uncompressed() {
        // A counter byte pattern compresses, so use a xorshift stream.
        let mut state = 0x2545F491u32;
        let body: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        assert!(maybe_compress(&body, 512).is_none());
    }

    #[test]
    fn garbage_fails_to_decompress() {
        assert!(Lz4::decompress_body(&[1, 2, 3], 100).is_err());
    }
}
