//! Symmetric per-session body transforms (encryption, compression).
//!
//! A transform only ever sees frame bodies: the length prefix is added after
//! encoding and stripped before decoding. Each codec half owns its own
//! transform instances, so transforms carry per-direction state freely.

use bytes::BytesMut;

/// Errors raised while reversing a transform on an inbound body.
///
/// Any of these means the byte stream can no longer be trusted.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The body is too short for the transform's own header.
    #[error("body too short for transform: {0} bytes")]
    Truncated(usize),
    /// An unknown marker byte was encountered.
    #[error("unknown transform flag: 0x{0:02X}")]
    UnknownFlag(u8),
    /// Decompression failed.
    #[error("decompression failed: {0}")]
    Decompress(String),
    /// The body would expand beyond the allowed size.
    #[error("body expands to {size} bytes, maximum is {max}")]
    TooLarge { size: usize, max: usize },
}

/// A reversible transform applied to every frame body of one direction.
pub trait PacketTransform: Send + 'static {
    /// Transform an outbound body in place.
    fn encode(&mut self, body: &mut BytesMut);

    /// Reverse the transform on an inbound body in place.
    fn decode(&mut self, body: &mut BytesMut) -> Result<(), TransformError>;

    /// Most bytes [`encode`](Self::encode) can add to a body.
    fn max_overhead(&self) -> usize {
        0
    }
}

/// Ordered stack of transforms that can start out pending.
///
/// Encoding applies transforms in the order they were added; decoding applies
/// them in reverse. While pending, bodies pass through untouched.
pub(crate) struct TransformStack {
    transforms: Vec<Box<dyn PacketTransform>>,
    active: bool,
}

impl TransformStack {
    pub(crate) fn new() -> Self {
        Self {
            transforms: Vec::new(),
            active: true,
        }
    }

    pub(crate) fn push(&mut self, transform: Box<dyn PacketTransform>) {
        self.transforms.push(transform);
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    /// Growth budget of the whole stack, counted even while pending.
    pub(crate) fn max_overhead(&self) -> usize {
        self.transforms.iter().map(|t| t.max_overhead()).sum()
    }

    pub(crate) fn encode(&mut self, body: &mut BytesMut) {
        if !self.active {
            return;
        }
        for transform in self.transforms.iter_mut() {
            transform.encode(body);
        }
    }

    pub(crate) fn decode(&mut self, body: &mut BytesMut) -> Result<(), TransformError> {
        if !self.active {
            return Ok(());
        }
        for transform in self.transforms.iter_mut().rev() {
            transform.decode(body)?;
        }
        Ok(())
    }
}
