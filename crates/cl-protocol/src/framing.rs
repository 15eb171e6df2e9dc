//! Length-prefixed frames over a byte stream.
//!
//! Wire layout, big-endian: `[u16 type][u32 length][length bytes of body]`.
//! The body is opaque at this layer; the peer parses it as the schema the
//! type code indicates.  Frames are written in submission order; a reader
//! buffers partial input and returns a frame only once header and full body
//! have arrived.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size: u16 type + u32 body length.
pub const HEADER_LEN: usize = 6;

/// Upper bound on a frame body.  Anything larger is a protocol violation and
/// closes the connection.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the stream (possibly mid-frame).
    #[error("connection closed")]
    Closed,
    #[error("frame body of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads frames from the read half of a stream.
///
/// Partial input stays in the internal buffer between calls, so the
/// `read_frame` future is cancel safe: dropping it mid-read loses nothing.
pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    /// Read one complete frame.
    pub async fn read_frame(&mut self) -> Result<(u16, Vec<u8>), FrameError> {
        loop {
            if self.buffer.len() >= HEADER_LEN {
                let message_type = u16::from_be_bytes([self.buffer[0], self.buffer[1]]);
                let len = u32::from_be_bytes([
                    self.buffer[2],
                    self.buffer[3],
                    self.buffer[4],
                    self.buffer[5],
                ]) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(FrameError::Oversized {
                        len,
                        max: MAX_FRAME_LEN,
                    });
                }
                if self.buffer.len() >= HEADER_LEN + len {
                    let body = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
                    self.buffer.drain(..HEADER_LEN + len);
                    return Ok((message_type, body));
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Writes frames to the write half of a stream.
///
/// A single task owns the writer, which serialises all frames on the
/// connection in submission order.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame and flush it.
    pub async fn write_frame(&mut self, message_type: u16, body: &[u8]) -> Result<(), FrameError> {
        if body.len() > MAX_FRAME_LEN {
            return Err(FrameError::Oversized {
                len: body.len(),
                max: MAX_FRAME_LEN,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&message_type.to_be_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);

        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut the write half down, flushing buffered data.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
