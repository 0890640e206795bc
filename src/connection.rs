// ABOUTME: Buffered frame-level I/O over any byte stream (plain TCP or TLS)
// ABOUTME: Reassembles whole CQL frames from a rolling read buffer without copying bodies

use crate::error::ProxyError;
use crate::frame::Frame;
use bytes::BytesMut;
use std::io::{self, Cursor};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Marker trait for the byte streams a connection can sit on. Blanket
/// implemented so `TcpStream`, TLS streams, and in-memory duplex pipes all
/// qualify.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Frame-oriented wrapper around a socket.
///
/// Reads accumulate into a rolling `BytesMut`; a frame is only split out of
/// the buffer once its full length has arrived, so a cancelled read never
/// loses data. Writes go through a `BufWriter` and are flushed per frame.
pub struct Connection {
    stream: BufWriter<Box<dyn Io>>,
    buffer: BytesMut,
    max_frame_length: usize,
}

impl Connection {
    pub fn new<S: Io + 'static>(socket: S, max_frame_length: usize) -> Connection {
        Connection {
            stream: BufWriter::new(Box::new(socket)),
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_length,
        }
    }

    /// Read a single frame from the underlying stream.
    ///
    /// Waits until enough data has been buffered to split off a whole frame.
    /// Returns `None` on a clean end of stream; a peer that disappears in the
    /// middle of a frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProxyError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::TruncatedStream);
            }
        }
    }

    /// Try to split one frame out of the read buffer. `Ok(None)` means more
    /// data is needed; anything the check rejects terminates the connection.
    fn parse_frame(&mut self) -> Result<Option<Frame>, ProxyError> {
        use crate::frame::FrameError::Incomplete;

        let mut cursor = Cursor::new(&self.buffer[..]);
        match Frame::check(&mut cursor, self.max_frame_length) {
            Ok(len) => {
                let bytes = self.buffer.split_to(len).freeze();
                Ok(Some(Frame::new(bytes)?))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write one frame and flush it to the socket.
    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.queue_frame(frame).await?;
        self.flush().await
    }

    /// Enqueue a frame into the write buffer without flushing. Only awaits
    /// when the buffer itself is full.
    pub async fn queue_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.stream.write_all(frame.bytes()).await
    }

    /// Flush everything queued so far to the socket.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DEFAULT_MAX_FRAME_LENGTH, FrameHeader, Opcode};
    use tokio::io::AsyncWriteExt;

    fn query_frame(stream: i16, body: &[u8]) -> Frame {
        let header = FrameHeader {
            version: 0x04,
            flags: 0,
            stream,
            opcode: Opcode::Query as u8,
            body_len: 0,
        };
        Frame::from_parts(header, body)
    }

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = Connection::new(a, DEFAULT_MAX_FRAME_LENGTH);
        let mut reader = Connection::new(b, DEFAULT_MAX_FRAME_LENGTH);

        let frame = query_frame(5, b"SELECT 1");
        writer.write_frame(&frame).await.unwrap();

        let read = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(read.bytes(), frame.bytes());
        assert_eq!(read.stream(), 5);
    }

    #[tokio::test]
    async fn split_delivery_reassembles() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = Connection::new(b, DEFAULT_MAX_FRAME_LENGTH);

        let frame = query_frame(1, b"0123456789");
        let bytes = frame.bytes().clone();
        let (first, rest) = bytes.split_at(7);

        a.write_all(first).await.unwrap();
        a.flush().await.unwrap();
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            reader.read_frame(),
        )
        .await;
        assert!(pending.is_err(), "partial frame must not be yielded");

        a.write_all(rest).await.unwrap();
        a.flush().await.unwrap();
        let read = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(read.bytes(), frame.bytes());
    }

    #[tokio::test]
    async fn two_frames_in_one_write() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = Connection::new(b, DEFAULT_MAX_FRAME_LENGTH);

        let f1 = query_frame(1, b"one");
        let f2 = query_frame(2, b"two");
        let mut both = f1.bytes().to_vec();
        both.extend_from_slice(f2.bytes());
        a.write_all(&both).await.unwrap();
        a.flush().await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap().unwrap().stream(), 1);
        assert_eq!(reader.read_frame().await.unwrap().unwrap().stream(), 2);
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (a, b) = tokio::io::duplex(64);
        let mut reader = Connection::new(b, DEFAULT_MAX_FRAME_LENGTH);
        drop(a);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = Connection::new(b, DEFAULT_MAX_FRAME_LENGTH);
        let frame = query_frame(1, b"partial");
        a.write_all(&frame.bytes()[..6]).await.unwrap();
        a.flush().await.unwrap();
        drop(a);
        assert!(matches!(
            reader.read_frame().await,
            Err(ProxyError::TruncatedStream)
        ));
    }
}
