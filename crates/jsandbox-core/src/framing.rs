//! Sentinel-delimited framing over unstructured byte streams
//!
//! Every message is its raw bytes followed by a single NUL byte. Payloads
//! are JSON text or diagnostics, neither of which may contain a raw NUL, so
//! the sentinel never collides with message content.

use crate::{JsandboxError, Result};
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame terminator
pub const SENTINEL: u8 = 0;

/// Default upper bound for a single frame (64KB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Append the sentinel to `payload`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if let Some(pos) = payload.iter().position(|&b| b == SENTINEL) {
        return Err(JsandboxError::Protocol(format!(
            "payload contains the frame sentinel at offset {pos}"
        )));
    }

    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.extend_from_slice(payload);
    frame.push(SENTINEL);
    Ok(frame)
}

/// Incremental frame splitter. Feed it chunks of any size, pull whole frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to be sentinel-free
    scanned: usize,
    max_frame_size: usize,
}

impl FrameDecoder {
    #[must_use]
    pub const fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_frame_size,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, if one is buffered.
    ///
    /// Fails once the pending bytes exceed the frame limit without a
    /// terminator; the decoder must not be used after that.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(pos) = self.buf[self.scanned..].iter().position(|&b| b == SENTINEL) {
            let end = self.scanned + pos;
            if end > self.max_frame_size {
                return Err(self.too_large(end));
            }
            let frame = self.buf[..end].to_vec();
            self.buf.drain(..=end);
            self.scanned = 0;
            return Ok(Some(frame));
        }

        self.scanned = self.buf.len();
        if self.buf.len() > self.max_frame_size {
            return Err(self.too_large(self.buf.len()));
        }
        Ok(None)
    }

    /// Bytes received after the last complete frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Validate end-of-stream: only legal on a frame boundary.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(JsandboxError::Protocol(format!(
                "stream closed mid-frame with {} bytes pending",
                self.buf.len()
            )))
        }
    }

    fn too_large(&self, len: usize) -> JsandboxError {
        JsandboxError::Protocol(format!(
            "frame of at least {len} bytes exceeds limit of {} bytes",
            self.max_frame_size
        ))
    }
}

/// Async frame source for the host side of a worker pipe.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame_size),
            chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    /// Next frame, or `None` on a clean end-of-stream.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                self.decoder.finish()?;
                return Ok(None);
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }
}

/// Blocking frame source for the worker side of the pipe.
#[derive(Debug)]
pub struct BlockingFrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: Read> BlockingFrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame_size),
            chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    /// Next frame, or `None` on a clean end-of-stream.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let n = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                self.decoder.finish()?;
                return Ok(None);
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }
}

/// Write one frame and flush it.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}
