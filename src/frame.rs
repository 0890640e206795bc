//! Cassandra native-protocol frame primitives.
//!
//! A frame is a 9-byte header followed by a body:
//!
//! ```text
//! [version:1][flags:1][stream_id:i16][opcode:1][length:u32][body:length]
//! ```
//!
//! All integers are big-endian. The most significant bit of `version` is the
//! direction of the message (0 = request, 1 = response); the low 7 bits are
//! the protocol version. The proxy treats bodies as opaque byte slices unless
//! a component explicitly needs to look inside one.

use bytes::{Buf, Bytes};
use num_enum::TryFromPrimitive;
use std::io::Cursor;
use thiserror::Error;

/// Size of the fixed frame header (protocol v3 and newer).
pub const HEADER_SIZE: usize = 9;

/// Default cap on a single frame body; connections carrying anything larger
/// are failed rather than buffered.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

const DIRECTION_MASK: u8 = 0x80;
const VERSION_MASK: u8 = 0x7f;

/// Message opcodes defined by the native protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0a,
    Register = 0x0b,
    Event = 0x0c,
    Batch = 0x0d,
    AuthChallenge = 0x0e,
    AuthResponse = 0x0f,
    AuthSuccess = 0x10,
}

/// Direction of a frame, taken from the MSB of the version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Header flag masks. Only compression matters to the proxy (compressed
/// bodies are never rewritten); the rest are preserved verbatim.
pub mod flags {
    pub const COMPRESSION: u8 = 0x01;
    pub const TRACING: u8 = 0x02;
    pub const CUSTOM_PAYLOAD: u8 = 0x04;
    pub const WARNING: u8 = 0x08;
}

/// Cheap classification of a frame by direction bit and opcode.
///
/// Derived from two header bytes; no allocation, no body access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Startup,
    Options,
    Query,
    Prepare,
    Execute,
    Batch,
    Register,
    AuthResponse,
    Ready,
    Authenticate,
    Supported,
    Result,
    Event,
    Error,
    Unknown,
}

impl FrameKind {
    /// Classify from the raw version byte and the raw opcode byte.
    pub fn classify(version: u8, opcode: u8) -> FrameKind {
        let response = version & DIRECTION_MASK != 0;
        match (response, Opcode::try_from(opcode).ok()) {
            (false, Some(Opcode::Startup)) => FrameKind::Startup,
            (false, Some(Opcode::Options)) => FrameKind::Options,
            (false, Some(Opcode::Query)) => FrameKind::Query,
            (false, Some(Opcode::Prepare)) => FrameKind::Prepare,
            (false, Some(Opcode::Execute)) => FrameKind::Execute,
            (false, Some(Opcode::Batch)) => FrameKind::Batch,
            (false, Some(Opcode::Register)) => FrameKind::Register,
            (false, Some(Opcode::AuthResponse)) => FrameKind::AuthResponse,
            (true, Some(Opcode::Ready)) => FrameKind::Ready,
            (true, Some(Opcode::Authenticate)) => FrameKind::Authenticate,
            (true, Some(Opcode::Supported)) => FrameKind::Supported,
            (true, Some(Opcode::Result)) => FrameKind::Result,
            (true, Some(Opcode::Event)) => FrameKind::Event,
            (true, Some(Opcode::Error)) => FrameKind::Error,
            _ => FrameKind::Unknown,
        }
    }

    /// Stable lowercase label, used as the `state` metric tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Startup => "startup",
            FrameKind::Options => "options",
            FrameKind::Query => "query",
            FrameKind::Prepare => "prepare",
            FrameKind::Execute => "execute",
            FrameKind::Batch => "batch",
            FrameKind::Register => "register",
            FrameKind::AuthResponse => "auth_response",
            FrameKind::Ready => "ready",
            FrameKind::Authenticate => "authenticate",
            FrameKind::Supported => "supported",
            FrameKind::Result => "result",
            FrameKind::Event => "event",
            FrameKind::Error => "error",
            FrameKind::Unknown => "unknown",
        }
    }
}

/// Frame-level errors. `Incomplete` is an expected runtime condition hit
/// whenever a partial frame sits in a read buffer.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("frame body of {length} bytes exceeds the {max} byte limit")]
    TooLarge { length: usize, max: usize },

    #[error("frame shorter than its header")]
    Header,
}

/// The decoded fixed header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw version byte, direction bit included.
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    /// Raw opcode byte; may not map to a known [`Opcode`].
    pub opcode: u8,
    pub body_len: u32,
}

impl FrameHeader {
    pub fn direction(&self) -> Direction {
        if self.version & DIRECTION_MASK != 0 {
            Direction::Response
        } else {
            Direction::Request
        }
    }

    /// Protocol version with the direction bit stripped.
    pub fn protocol_version(&self) -> u8 {
        self.version & VERSION_MASK
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.opcode).ok()
    }

    pub fn compression(&self) -> bool {
        self.flags & flags::COMPRESSION != 0
    }

    /// Decode from the first 9 bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<FrameHeader, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Header);
        }
        Ok(FrameHeader {
            version: bytes[0],
            flags: bytes[1],
            stream: i16::from_be_bytes([bytes[2], bytes[3]]),
            opcode: bytes[4],
            body_len: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let stream = self.stream.to_be_bytes();
        let len = self.body_len.to_be_bytes();
        [
            self.version,
            self.flags,
            stream[0],
            stream[1],
            self.opcode,
            len[0],
            len[1],
            len[2],
            len[3],
        ]
    }
}

/// A whole frame: parsed header plus the full wire bytes (header included).
///
/// The byte buffer is the unit of forwarding; it is immutable once built, so
/// fanning the same frame out to two upstreams is a refcount bump, not a copy.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    bytes: Bytes,
}

impl Frame {
    /// Wrap a complete wire buffer. The buffer must hold exactly one frame.
    pub fn new(bytes: Bytes) -> Result<Frame, FrameError> {
        let header = FrameHeader::parse(&bytes)?;
        if bytes.len() != HEADER_SIZE + header.body_len as usize {
            return Err(FrameError::Header);
        }
        Ok(Frame { header, bytes })
    }

    /// Build a frame from a header and body, fixing up the length field.
    pub fn from_parts(mut header: FrameHeader, body: &[u8]) -> Frame {
        header.body_len = body.len() as u32;
        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(body);
        Frame {
            header,
            bytes: Bytes::from(buf),
        }
    }

    /// The full wire representation, header included.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    pub fn stream(&self) -> i16 {
        self.header.stream
    }

    pub fn kind(&self) -> FrameKind {
        FrameKind::classify(self.header.version, self.header.opcode)
    }

    /// Checks whether a whole frame can be read from `src` and returns its
    /// total length. This is much cheaper than a full parse and lets the
    /// connection skip allocating until the complete frame has arrived.
    pub fn check(src: &mut Cursor<&[u8]>, max_body: usize) -> Result<usize, FrameError> {
        if src.remaining() < HEADER_SIZE {
            return Err(FrameError::Incomplete);
        }
        let buf = *src.get_ref();
        let pos = src.position() as usize;
        let body_len =
            u32::from_be_bytes([buf[pos + 5], buf[pos + 6], buf[pos + 7], buf[pos + 8]]) as usize;
        if body_len > max_body {
            return Err(FrameError::TooLarge {
                length: body_len,
                max: max_body,
            });
        }
        let total = HEADER_SIZE + body_len;
        if src.remaining() < total {
            return Err(FrameError::Incomplete);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_frame(version: u8, flags: u8, stream: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
        let header = FrameHeader {
            version,
            flags,
            stream,
            opcode,
            body_len: body.len() as u32,
        };
        let mut buf = header.encode().to_vec();
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader {
            version: 0x84,
            flags: 0x02,
            stream: -1,
            opcode: Opcode::Event as u8,
            body_len: 42,
        };
        let decoded = FrameHeader::parse(&header.encode()).unwrap();
        assert_eq!(header, decoded);
        assert_eq!(decoded.direction(), Direction::Response);
        assert_eq!(decoded.protocol_version(), 4);
        assert_eq!(decoded.stream, -1);
    }

    #[test]
    fn check_incomplete_header() {
        let data = [0x04u8, 0x00];
        let mut cursor = Cursor::new(&data[..]);
        assert!(matches!(
            Frame::check(&mut cursor, DEFAULT_MAX_FRAME_LENGTH),
            Err(FrameError::Incomplete)
        ));
    }

    #[test]
    fn check_incomplete_body() {
        let mut data = raw_frame(0x04, 0, 1, Opcode::Query as u8, &[1, 2, 3, 4]);
        data.truncate(11);
        let mut cursor = Cursor::new(&data[..]);
        assert!(matches!(
            Frame::check(&mut cursor, DEFAULT_MAX_FRAME_LENGTH),
            Err(FrameError::Incomplete)
        ));
    }

    #[test]
    fn check_complete_returns_total_length() {
        let data = raw_frame(0x04, 0, 1, Opcode::Query as u8, b"body");
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(
            Frame::check(&mut cursor, DEFAULT_MAX_FRAME_LENGTH).unwrap(),
            HEADER_SIZE + 4
        );
    }

    #[test]
    fn check_rejects_oversized_body() {
        let mut data = raw_frame(0x04, 0, 1, Opcode::Query as u8, &[]);
        data[5..9].copy_from_slice(&(1024u32).to_be_bytes());
        let mut cursor = Cursor::new(&data[..]);
        assert!(matches!(
            Frame::check(&mut cursor, 512),
            Err(FrameError::TooLarge { length: 1024, max: 512 })
        ));
    }

    #[test]
    fn classify_requests_and_responses() {
        assert_eq!(FrameKind::classify(0x04, 0x01), FrameKind::Startup);
        assert_eq!(FrameKind::classify(0x04, 0x05), FrameKind::Options);
        assert_eq!(FrameKind::classify(0x04, 0x07), FrameKind::Query);
        assert_eq!(FrameKind::classify(0x04, 0x0d), FrameKind::Batch);
        assert_eq!(FrameKind::classify(0x84, 0x08), FrameKind::Result);
        assert_eq!(FrameKind::classify(0x84, 0x06), FrameKind::Supported);
        assert_eq!(FrameKind::classify(0x84, 0x00), FrameKind::Error);
        assert_eq!(FrameKind::classify(0x84, 0x0c), FrameKind::Event);
        // direction mismatch or unknown opcode
        assert_eq!(FrameKind::classify(0x84, 0x07), FrameKind::Unknown);
        assert_eq!(FrameKind::classify(0x04, 0x7f), FrameKind::Unknown);
    }

    #[test]
    fn frame_accessors() {
        let data = raw_frame(0x05, 0, 7, Opcode::Query as u8, b"q");
        let frame = Frame::new(Bytes::from(data)).unwrap();
        assert_eq!(frame.stream(), 7);
        assert_eq!(frame.kind(), FrameKind::Query);
        assert_eq!(frame.body(), b"q");
        assert_eq!(frame.header.protocol_version(), 5);
    }

    #[test]
    fn from_parts_fixes_length() {
        let header = FrameHeader {
            version: 0x84,
            flags: 0,
            stream: 3,
            opcode: Opcode::Result as u8,
            body_len: 0,
        };
        let frame = Frame::from_parts(header, b"abcdef");
        assert_eq!(frame.header.body_len, 6);
        assert_eq!(frame.bytes().len(), HEADER_SIZE + 6);
    }
}
