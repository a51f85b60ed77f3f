//! Conditional LZ4 compression of frame bodies.
//!
//! Large bodies are compressed with LZ4 before transmission, while small ones
//! skip compression to avoid overhead. Every transformed body starts with a
//! flag byte telling the peer which case applies. A compressed body carries
//! its decompressed size as a little-endian `u32` right after the flag; that
//! size is checked against [`CompressionConfig::max_decompressed_len`] before
//! anything is allocated.

use bytes::{Buf, BufMut, BytesMut};
use lz4_flex::block::decompress;
use lz4_flex::compress_prepend_size;

use crate::transform::{PacketTransform, TransformError};

/// Compression flag: body is uncompressed.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Compression flag: body is LZ4-compressed.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Controls when bodies are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum body size (bytes) before compression is applied. Default: 256.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
    /// Largest body an inbound frame may decompress to. Default: 65533.
    pub max_decompressed_len: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 256,
            enabled: true,
            max_decompressed_len: u16::MAX as usize - 2,
        }
    }
}

/// LZ4 body compression as a [`PacketTransform`].
#[derive(Debug, Clone, Default)]
pub struct Lz4Compression {
    config: CompressionConfig,
}

impl Lz4Compression {
    /// Create a transform with the given thresholds.
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }
}

impl PacketTransform for Lz4Compression {
    fn encode(&mut self, body: &mut BytesMut) {
        if self.config.enabled && body.len() >= self.config.threshold {
            let compressed = compress_prepend_size(&body[..]);
            // Incompressible bodies go out raw so growth stays at one byte.
            if compressed.len() < body.len() {
                let mut out = BytesMut::with_capacity(1 + compressed.len());
                out.put_u8(COMPRESSION_FLAG_LZ4);
                out.extend_from_slice(&compressed);
                *body = out;
                return;
            }
        }

        let mut out = BytesMut::with_capacity(1 + body.len());
        out.put_u8(COMPRESSION_FLAG_NONE);
        out.extend_from_slice(&body[..]);
        *body = out;
    }

    fn decode(&mut self, body: &mut BytesMut) -> Result<(), TransformError> {
        if body.is_empty() {
            return Err(TransformError::Truncated(0));
        }

        match body[0] {
            COMPRESSION_FLAG_NONE => {
                body.advance(1);
                Ok(())
            }
            COMPRESSION_FLAG_LZ4 => {
                if body.len() < 5 {
                    return Err(TransformError::Truncated(body.len()));
                }
                body.advance(1);
                let size = body.get_u32_le() as usize;
                let max = self.config.max_decompressed_len;
                if size > max {
                    return Err(TransformError::TooLarge { size, max });
                }
                let decompressed = decompress(&body[..], size)
                    .map_err(|e| TransformError::Decompress(e.to_string()))?;
                *body = BytesMut::from(&decompressed[..]);
                Ok(())
            }
            flag => Err(TransformError::UnknownFlag(flag)),
        }
    }

    fn max_overhead(&self) -> usize {
        1
    }
}
