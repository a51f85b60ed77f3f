//! Packet contracts: bounded body cursor, body writer, and the incoming and
//! outgoing packet traits.
//!
//! Integers are little-endian. Strings are UTF-16LE terminated by a NUL code
//! unit.

use std::fmt;
use std::future::Future;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::connection::{Connection, SendError};
use crate::session::Session;

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Errors raised while reading a packet body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// A read asked for more bytes than the frame holds.
    #[error("unexpected end of packet: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd {
        /// Bytes requested.
        needed: usize,
        /// Bytes left in the frame.
        remaining: usize,
    },
    /// The packet did not consume its whole body.
    #[error("{0} unread bytes after packet body")]
    TrailingBytes(usize),
    /// A string ran to the end of the frame without a terminator.
    #[error("unterminated string")]
    UnterminatedString,
    /// A string contained an unpaired surrogate.
    #[error("invalid UTF-16 string")]
    InvalidString,
}

/// Cursor over exactly one frame body.
///
/// Reads past the end fail with [`ReadError::UnexpectedEnd`] and leave the
/// cursor where it was.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a reader over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Fail if any bytes remain unread.
    pub fn finish(&self) -> Result<(), ReadError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ReadError::TrailingBytes(n)),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ReadError> {
        if n > self.remaining() {
            return Err(ReadError::UnexpectedEnd {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.take(1)?.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, ReadError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, ReadError> {
        Ok(self.take(2)?.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, ReadError> {
        Ok(self.take(4)?.get_u32_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, ReadError> {
        Ok(self.take(4)?.get_i32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, ReadError> {
        Ok(self.take(8)?.get_u64_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, ReadError> {
        Ok(self.take(8)?.get_i64_le())
    }

    pub fn read_f64(&mut self) -> Result<f64, ReadError> {
        Ok(self.take(8)?.get_f64_le())
    }

    /// Borrow the next `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ReadError> {
        self.take(n)
    }

    /// Read a NUL-terminated UTF-16LE string.
    pub fn read_string(&mut self) -> Result<String, ReadError> {
        let rest = &self.buf[self.pos..];
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();

        let consumed = (units.len() + 1) * 2;
        if consumed > rest.len() {
            return Err(ReadError::UnterminatedString);
        }
        let text = String::from_utf16(&units).map_err(|_| ReadError::InvalidString)?;
        self.pos += consumed;
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Little-endian body writer for outgoing packets.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(value as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16_le(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64_le(value);
        self
    }

    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        self.buf.put_f64_le(value);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Write `text` as UTF-16LE followed by a NUL code unit.
    pub fn write_string(&mut self, text: &str) -> &mut Self {
        for unit in text.encode_utf16() {
            self.buf.put_u16_le(unit);
        }
        self.buf.put_u16_le(0);
        self
    }

    /// Finish the body.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

// ---------------------------------------------------------------------------
// Packet codes
// ---------------------------------------------------------------------------

/// Registry key: an opcode plus an optional sub-opcode for extended packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketCode {
    pub opcode: u16,
    pub sub_opcode: Option<u16>,
}

impl PacketCode {
    pub const fn new(opcode: u16) -> Self {
        Self {
            opcode,
            sub_opcode: None,
        }
    }

    pub const fn extended(opcode: u16, sub_opcode: u16) -> Self {
        Self {
            opcode,
            sub_opcode: Some(sub_opcode),
        }
    }
}

impl From<u16> for PacketCode {
    fn from(opcode: u16) -> Self {
        Self::new(opcode)
    }
}

impl fmt::Display for PacketCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_opcode {
            None => write!(f, "0x{:02X}", self.opcode),
            Some(sub) => write!(f, "0x{:02X}:0x{:04X}", self.opcode, sub),
        }
    }
}

// ---------------------------------------------------------------------------
// Packet traits
// ---------------------------------------------------------------------------

/// What the receive loop does after a packet has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketOutcome {
    /// Keep reading.
    #[default]
    Continue,
    /// Activate the codec's pending transforms in both directions. Packets
    /// already queued for sending still go out untransformed.
    ActivateTransforms,
    /// Close the connection once this packet is done.
    Disconnect,
}

/// Per-frame failures. None of these close the connection.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("malformed packet body: {0}")]
    Read(#[from] ReadError),

    #[error("failed to queue reply: {0}")]
    Send(#[from] SendError),

    #[error("packet rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A packet received from a client: parsed from its frame, then processed.
///
/// A fresh value is created with `Default` for every frame and dropped after
/// [`process`](IncomingPacket::process) returns.
pub trait IncomingPacket<S: Session>: Default + Send + 'static {
    /// Read the body that follows the packet code. Packets without a body
    /// keep the default.
    fn read_body(&mut self, reader: &mut PacketReader<'_>) -> Result<(), ReadError> {
        let _ = reader;
        Ok(())
    }

    /// Apply the packet. Runs on the connection's receive loop, so the next
    /// frame waits until this future completes.
    fn process(
        self,
        connection: &Connection<S>,
        session: &S,
    ) -> impl Future<Output = Result<PacketOutcome, PacketError>> + Send;
}

/// A packet sent to a client. Writes its own opcode followed by the body.
pub trait OutgoingPacket {
    fn write(&self, writer: &mut PacketWriter);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_little_endian_fields() {
        let mut writer = PacketWriter::new();
        writer
            .write_u8(0x7F)
            .write_u16(0xBEEF)
            .write_u32(0xDEAD_BEEF)
            .write_i32(-5)
            .write_u64(1 << 40)
            .write_f64(2.5)
            .write_bool(true);
        let body = writer.into_bytes();
        assert_eq!(&body[1..3], &[0xEF, 0xBE]);

        let mut reader = PacketReader::new(&body);
        assert_eq!(reader.read_u8().unwrap(), 0x7F);
        assert_eq!(reader.read_u16().unwrap(), 0xBEEF);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_i32().unwrap(), -5);
        assert_eq!(reader.read_u64().unwrap(), 1 << 40);
        assert_eq!(reader.read_f64().unwrap(), 2.5);
        assert!(reader.read_bool().unwrap());
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_overread_is_error_not_panic() {
        let mut reader = PacketReader::new(&[0x01, 0x02, 0x03]);
        assert_eq!(reader.read_u16().unwrap(), 0x0201);

        let result = reader.read_u32();
        assert_eq!(
            result,
            Err(ReadError::UnexpectedEnd {
                needed: 4,
                remaining: 1
            })
        );
        // A failed read does not move the cursor.
        assert_eq!(reader.position(), 2);
        assert_eq!(reader.read_u8().unwrap(), 0x03);
    }

    #[test]
    fn test_finish_reports_trailing_bytes() {
        let mut reader = PacketReader::new(&[0x01, 0x02, 0x03]);
        reader.read_u8().unwrap();
        assert_eq!(reader.finish(), Err(ReadError::TrailingBytes(2)));
    }

    #[test]
    fn test_string_utf16_with_terminator() {
        let mut writer = PacketWriter::new();
        writer.write_string("Gludio").write_u8(0xAA);
        let body = writer.into_bytes();
        assert_eq!(body.len(), 6 * 2 + 2 + 1);

        let mut reader = PacketReader::new(&body);
        assert_eq!(reader.read_string().unwrap(), "Gludio");
        assert_eq!(reader.read_u8().unwrap(), 0xAA);
    }

    #[test]
    fn test_non_ascii_string() {
        let mut writer = PacketWriter::new();
        writer.write_string("Адена 🪙");
        let body = writer.into_bytes();

        let mut reader = PacketReader::new(&body);
        assert_eq!(reader.read_string().unwrap(), "Адена 🪙");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_unterminated_string() {
        let body = [b'a', 0x00, b'b', 0x00, b'c'];
        let mut reader = PacketReader::new(&body);
        assert_eq!(reader.read_string(), Err(ReadError::UnterminatedString));
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_empty_string() {
        let mut reader = PacketReader::new(&[0x00, 0x00]);
        assert_eq!(reader.read_string().unwrap(), "");
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_packet_code_display() {
        assert_eq!(PacketCode::new(0x1F).to_string(), "0x1F");
        assert_eq!(PacketCode::new(0x7).to_string(), "0x07");
        assert_eq!(PacketCode::extended(0xD0, 0x12).to_string(), "0xD0:0x0012");
    }
}
