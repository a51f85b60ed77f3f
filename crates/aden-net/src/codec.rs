//! Length-prefixed framing for packet streams.
//!
//! Every packet on the wire is a length-prefixed frame:
//!
//! ```text
//! +-------------------+------------------------------+
//! | length (2 bytes)  |   body                       |
//! | u16 little-endian |   opcode bytes + payload     |
//! +-------------------+------------------------------+
//! ```
//!
//! By default the length counts the body only. With
//! [`FrameConfig::length_includes_prefix`] it also counts its own two bytes.
//! A zero-length body is a valid no-op frame (keepalive padding) and bypasses
//! the transform stack in both directions.
//!
//! [`FrameDecoder`] and [`FrameEncoder`] are the two halves of a session's
//! [`PacketCodec`]: the receive loop owns the decoder and the writer task owns
//! the encoder, each with private transform state.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::transform::{PacketTransform, TransformError, TransformStack};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum body size in bytes, after transforms. Default: 65533.
    pub max_frame_len: usize,
    /// Whether the declared length counts the prefix itself. Default: false.
    pub length_includes_prefix: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_len: u16::MAX as usize - LENGTH_PREFIX_LEN,
            length_includes_prefix: false,
        }
    }
}

impl FrameConfig {
    /// Largest body that both fits the prefix and respects `max_frame_len`.
    pub fn max_body_len(&self) -> usize {
        let prefix_room = if self.length_includes_prefix {
            LENGTH_PREFIX_LEN
        } else {
            0
        };
        self.max_frame_len.min(u16::MAX as usize - prefix_room)
    }

    fn body_len(&self, declared: u16) -> Result<usize, CodecError> {
        let declared = declared as usize;
        let body_len = if self.length_includes_prefix {
            declared
                .checked_sub(LENGTH_PREFIX_LEN)
                .ok_or(CodecError::InvalidLength { declared })?
        } else {
            declared
        };

        if body_len > self.max_body_len() {
            return Err(CodecError::FrameTooLarge {
                size: body_len,
                max: self.max_body_len(),
            });
        }
        Ok(body_len)
    }

    fn declared_len(&self, body_len: usize) -> u16 {
        if self.length_includes_prefix {
            (body_len + LENGTH_PREFIX_LEN) as u16
        } else {
            body_len as u16
        }
    }
}

/// Errors that make a connection's byte stream untrustworthy.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The length prefix is smaller than the prefix itself.
    #[error("declared frame length {declared} is shorter than its own prefix")]
    InvalidLength {
        /// The value read from the wire.
        declared: usize,
    },

    /// The body size exceeds the configured maximum.
    #[error("frame body size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// The actual body size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// A transform could not be reversed; the codec is out of sync.
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound half of a [`PacketCodec`]: extracts one frame body at a time.
pub struct FrameDecoder {
    config: FrameConfig,
    transforms: TransformStack,
}

impl FrameDecoder {
    /// Activate the transform stack for every subsequent frame.
    pub fn activate_transforms(&mut self) {
        self.transforms.set_active(true);
    }

    /// Whether inbound bodies are currently run through the transforms.
    pub fn transforms_active(&self) -> bool {
        self.transforms.is_active()
    }
}

impl Decoder for FrameDecoder {
    type Item = Bytes;
    type Error = CodecError;

    /// Extract the next complete frame body, or `None` if more bytes are needed.
    ///
    /// Partial frames stay in `src` untouched until the rest arrives.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let declared = u16::from_le_bytes([src[0], src[1]]);
        let body_len = self.config.body_len(declared)?;
        let frame_len = LENGTH_PREFIX_LEN + body_len;

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let mut body = src.split_to(body_len);
        if !body.is_empty() {
            self.transforms.decode(&mut body)?;
        }

        let max = self.config.max_body_len();
        if body.len() > max {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                max,
            });
        }
        Ok(Some(body.freeze()))
    }
}

/// Outbound half of a [`PacketCodec`]: turns bodies into self-framed units.
pub struct FrameEncoder {
    config: FrameConfig,
    transforms: TransformStack,
}

impl FrameEncoder {
    /// Activate the transform stack for every subsequent frame.
    pub fn activate_transforms(&mut self) {
        self.transforms.set_active(true);
    }

    /// Whether outbound bodies are currently run through the transforms.
    pub fn transforms_active(&self) -> bool {
        self.transforms.is_active()
    }

    /// The framing configuration this encoder enforces.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Largest body [`encode`](Encoder::encode) accepts: the frame limit minus
    /// what the transforms may add, whether or not they are active yet.
    pub fn max_body_len(&self) -> usize {
        self.config
            .max_body_len()
            .saturating_sub(self.transforms.max_overhead())
    }
}

impl Encoder<Bytes> for FrameEncoder {
    type Error = CodecError;

    /// Frame one body. An oversized body is refused before any transform
    /// state changes, so the stream stays usable.
    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        let max = self.max_body_len();
        if item.len() > max {
            return Err(CodecError::FrameTooLarge {
                size: item.len(),
                max,
            });
        }

        let mut body = BytesMut::from(&item[..]);
        if !body.is_empty() {
            self.transforms.encode(&mut body);
        }

        let max = self.config.max_body_len();
        if body.len() > max {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                max,
            });
        }

        dst.reserve(LENGTH_PREFIX_LEN + body.len());
        dst.put_u16_le(self.config.declared_len(body.len()));
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// A session's codec: a decoder and an encoder sharing one configuration.
pub struct PacketCodec {
    decoder: FrameDecoder,
    encoder: FrameEncoder,
}

impl PacketCodec {
    /// Create a codec without transforms.
    pub fn new(config: FrameConfig) -> Self {
        Self {
            decoder: FrameDecoder {
                config: config.clone(),
                transforms: TransformStack::new(),
            },
            encoder: FrameEncoder {
                config,
                transforms: TransformStack::new(),
            },
        }
    }

    /// Append a transform. Each half receives its own copy of `transform`.
    pub fn with_transform<T: PacketTransform + Clone>(mut self, transform: T) -> Self {
        self.decoder.transforms.push(Box::new(transform.clone()));
        self.encoder.transforms.push(Box::new(transform));
        self
    }

    /// Leave the transforms inactive until the connection activates them,
    /// typically after a handshake packet has exchanged keys.
    pub fn pending(mut self) -> Self {
        self.decoder.transforms.set_active(false);
        self.encoder.transforms.set_active(false);
        self
    }

    /// Split into the receive-side and send-side halves.
    pub fn into_parts(self) -> (FrameDecoder, FrameEncoder) {
        (self.decoder, self.encoder)
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(FrameConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::XorCipher;
    use crate::compression::Lz4Compression;

    fn encode_all(encoder: &mut FrameEncoder, bodies: &[&[u8]]) -> BytesMut {
        let mut wire = BytesMut::new();
        for body in bodies {
            encoder
                .encode(Bytes::copy_from_slice(body), &mut wire)
                .unwrap();
        }
        wire
    }

    fn decode_all(decoder: &mut FrameDecoder, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = BytesMut::from(&[0x03, 0x00, 0x01, 0xAA, 0xBB, 0x02, 0x00, 0x02, 0xCC][..]);
        let (mut decoder, _) = PacketCodec::default().into_parts();

        let frames = decode_all(&mut decoder, &mut buf);
        assert_eq!(frames, vec![&[0x01, 0xAA, 0xBB][..], &[0x02, 0xCC][..]]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let (mut decoder, _) = PacketCodec::default().into_parts();
        let mut buf = BytesMut::from(&[0x04, 0x00, 0x01, 0x02][..]);

        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4, "partial bytes must stay buffered");

        buf.extend_from_slice(&[0x03, 0x04, 0x09]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[..], &[0x09], "leftover bytes stay for the next frame");
    }

    #[test]
    fn test_chunking_does_not_change_frames() {
        let bodies: Vec<&[u8]> = vec![b"\x01ab", b"\x02", b"\x03longer body here", b"", b"\x04z"];
        let (_, mut encoder) = PacketCodec::default().into_parts();
        let wire = encode_all(&mut encoder, &bodies);

        for chunk_size in 1..=wire.len() {
            let (mut decoder, _) = PacketCodec::default().into_parts();
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                frames.extend(decode_all(&mut decoder, &mut buf));
            }
            assert_eq!(frames, bodies, "chunk size {chunk_size} changed the frames");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_every_split_point_with_cipher() {
        let key = XorCipher::random_key();
        let codec = || PacketCodec::default().with_transform(XorCipher::new(key));
        let bodies: Vec<&[u8]> = vec![b"\x10first", b"\x11second one", b"\x12third"];
        let (_, mut encoder) = codec().into_parts();
        let wire = encode_all(&mut encoder, &bodies);

        for split in 0..=wire.len() {
            let (mut decoder, _) = codec().into_parts();
            let mut buf = BytesMut::from(&wire[..split]);
            let mut frames = decode_all(&mut decoder, &mut buf);
            buf.extend_from_slice(&wire[split..]);
            frames.extend(decode_all(&mut decoder, &mut buf));
            assert_eq!(frames, bodies, "split at {split} changed the frames");
        }
    }

    #[test]
    fn test_length_includes_prefix() {
        let config = FrameConfig {
            length_includes_prefix: true,
            ..FrameConfig::default()
        };
        let (mut decoder, mut encoder) = PacketCodec::new(config).into_parts();

        let mut wire = encode_all(&mut encoder, &[b"\x05abc"]);
        assert_eq!(&wire[..2], &6u16.to_le_bytes());

        let frame = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(&frame[..], b"\x05abc");
    }

    #[test]
    fn test_declared_length_shorter_than_prefix_rejected() {
        let config = FrameConfig {
            length_includes_prefix: true,
            ..FrameConfig::default()
        };
        let (mut decoder, _) = PacketCodec::new(config).into_parts();
        let mut buf = BytesMut::from(&[0x01, 0x00, 0xFF][..]);

        let result = decoder.decode(&mut buf);
        assert!(matches!(
            result,
            Err(CodecError::InvalidLength { declared: 1 })
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_on_decode() {
        let config = FrameConfig {
            max_frame_len: 16,
            ..FrameConfig::default()
        };
        let (mut decoder, _) = PacketCodec::new(config).into_parts();
        // Only the prefix has arrived; the size alone proves the frame is bad.
        let mut buf = BytesMut::from(&1024u16.to_le_bytes()[..]);

        let result = decoder.decode(&mut buf);
        assert!(
            matches!(result, Err(CodecError::FrameTooLarge { size: 1024, max: 16 })),
            "Should reject oversized frame"
        );
    }

    #[test]
    fn test_oversized_frame_rejected_on_encode() {
        let config = FrameConfig {
            max_frame_len: 16,
            ..FrameConfig::default()
        };
        let (_, mut encoder) = PacketCodec::new(config).into_parts();
        let mut wire = BytesMut::new();

        let result = encoder.encode(Bytes::from(vec![0u8; 64]), &mut wire);
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_zero_length_frame_handled() {
        let (mut decoder, mut encoder) = PacketCodec::default()
            .with_transform(Lz4Compression::default())
            .into_parts();
        let mut wire = encode_all(&mut encoder, &[b""]);
        assert_eq!(&wire[..], &[0x00, 0x00]);

        let frame = decoder.decode(&mut wire).unwrap().unwrap();
        assert!(frame.is_empty(), "Zero-length body should be valid");
    }

    #[test]
    fn test_pending_transforms_activate_in_step() {
        let key = XorCipher::random_key();
        let codec = || {
            PacketCodec::default()
                .with_transform(XorCipher::new(key))
                .pending()
        };
        let (mut decoder, _) = codec().into_parts();
        let (_, mut encoder) = codec().into_parts();
        assert!(!encoder.transforms_active());

        let mut wire = encode_all(&mut encoder, &[b"\x01plain"]);
        assert_eq!(&wire[2..], b"\x01plain");
        assert_eq!(decode_all(&mut decoder, &mut wire), vec![&b"\x01plain"[..]]);

        encoder.activate_transforms();
        decoder.activate_transforms();
        let mut wire = encode_all(&mut encoder, &[b"\x02secret"]);
        assert_ne!(&wire[2..], b"\x02secret");
        assert_eq!(decode_all(&mut decoder, &mut wire), vec![&b"\x02secret"[..]]);
    }

    #[test]
    fn test_stacked_compression_and_cipher() {
        let key = XorCipher::random_key();
        let codec = || {
            PacketCodec::default()
                .with_transform(Lz4Compression::default())
                .with_transform(XorCipher::new(key))
        };
        let (mut decoder, _) = codec().into_parts();
        let (_, mut encoder) = codec().into_parts();

        let big = vec![0x33u8; 4096];
        let mut wire = encode_all(&mut encoder, &[&big, b"\x01small"]);
        assert!(wire.len() < big.len());

        let frames = decode_all(&mut decoder, &mut wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &big[..]);
        assert_eq!(&frames[1][..], b"\x01small");
    }

    #[test]
    fn test_corrupt_transform_is_codec_error() {
        let (mut decoder, _) = PacketCodec::default()
            .with_transform(Lz4Compression::default())
            .into_parts();
        let mut buf = BytesMut::from(&[0x02, 0x00, 0xEE, 0x00][..]);

        let result = decoder.decode(&mut buf);
        assert!(matches!(
            result,
            Err(CodecError::Transform(TransformError::UnknownFlag(0xEE)))
        ));
    }

    #[test]
    fn test_transform_overhead_is_reserved() {
        let config = FrameConfig {
            max_frame_len: 16,
            ..FrameConfig::default()
        };
        let key = XorCipher::random_key();
        let codec = || {
            PacketCodec::new(config.clone())
                .with_transform(Lz4Compression::default())
                .with_transform(XorCipher::new(key))
        };
        let (mut decoder, _) = codec().into_parts();
        let (_, mut encoder) = codec().into_parts();
        assert_eq!(encoder.max_body_len(), 15);

        let mut wire = BytesMut::new();
        let result = encoder.encode(Bytes::from(vec![0x01; 16]), &mut wire);
        assert!(matches!(
            result,
            Err(CodecError::FrameTooLarge { size: 16, max: 15 })
        ));
        assert!(wire.is_empty());

        // The refused body left the cipher in step with the peer.
        let mut wire = encode_all(&mut encoder, &[&[0x02; 15]]);
        assert_eq!(wire.len(), 2 + 16);
        assert_eq!(decode_all(&mut decoder, &mut wire), vec![&[0x02; 15][..]]);
    }

    #[test]
    fn test_decompression_bomb_rejected_on_decode() {
        let (mut decoder, _) = PacketCodec::default()
            .with_transform(Lz4Compression::default())
            .into_parts();
        let mut body = BytesMut::from(&vec![0u8; 8 * 1024 * 1024][..]);
        Lz4Compression::default().encode(&mut body);
        let mut wire = BytesMut::new();
        wire.put_u16_le(body.len() as u16);
        wire.extend_from_slice(&body);

        let result = decoder.decode(&mut wire);
        assert!(matches!(
            result,
            Err(CodecError::Transform(TransformError::TooLarge {
                size: 8_388_608,
                ..
            }))
        ));
    }

    #[test]
    fn test_decoded_body_above_frame_limit_rejected() {
        let config = FrameConfig {
            max_frame_len: 64,
            ..FrameConfig::default()
        };
        let (mut decoder, _) = PacketCodec::new(config)
            .with_transform(Lz4Compression::default())
            .into_parts();
        let mut body = BytesMut::from(&[0u8; 1024][..]);
        Lz4Compression::default().encode(&mut body);
        assert!(body.len() <= 64);
        let mut wire = BytesMut::new();
        wire.put_u16_le(body.len() as u16);
        wire.extend_from_slice(&body);

        let result = decoder.decode(&mut wire);
        assert!(matches!(
            result,
            Err(CodecError::FrameTooLarge { size: 1024, max: 64 })
        ));
    }
}
