//! Stream demultiplexing.
//!
//! With a TTY-less container, Docker multiplexes stdout and stderr over the
//! single attached connection. Each frame is an 8-byte header followed by
//! the payload:
//!
//! ```text
//! [tag, 0, 0, 0, len (u32, big endian)] [len bytes]
//! tag: 0 = stdin, 1 = stdout, 2 = stderr
//! ```
//!
//! [`read_frame`] decodes that wire format from any `AsyncRead`;
//! [`Demultiplexer`] accumulates decoded frames per stream until the channel
//! closes. Byte order within each stream is preserved. The interleaving
//! between stdout and stderr is not.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::RuntimeError;

/// Size of a frame header.
pub const HEADER_LEN: usize = 8;

/// Largest payload accepted in one frame. Docker's writer copies at most
/// 32 KiB per frame; longer headers are treated as corrupt instead of
/// being allocated. Encoding splits longer payloads at this size.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

/// One decoded chunk of output.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: StreamKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Wire encoding (header + payload). Payloads over [`MAX_FRAME_LEN`]
    /// become several consecutive frames of the same stream.
    pub fn encode(&self) -> Bytes {
        let chunk_len = MAX_FRAME_LEN as usize;
        let chunks = self.payload.len().div_ceil(chunk_len).max(1);
        let mut buf = BytesMut::with_capacity(chunks * HEADER_LEN + self.payload.len());
        let mut rest = &self.payload[..];
        loop {
            let (chunk, tail) = rest.split_at(rest.len().min(chunk_len));
            // Bounded by MAX_FRAME_LEN
            let len = chunk.len() as u32;
            buf.extend_from_slice(&[self.kind.tag(), 0, 0, 0]);
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(chunk);
            if tail.is_empty() {
                break;
            }
            rest = tail;
        }
        buf.freeze()
    }
}

/// Reads the next frame. `Ok(None)` on a clean close between frames;
/// a close in the middle of a frame is `UnexpectedEof`.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("channel closed inside a frame header ({filled}/{HEADER_LEN} bytes)"),
            ));
        }
        filled += n;
    }

    let kind = StreamKind::from_tag(header[0]).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown stream tag {}", header[0]),
        )
    })?;
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame::new(kind, payload)))
}

/// Turns a raw multiplexed channel into a stream of frames.
pub fn frames<R>(reader: R) -> BoxStream<'static, Result<Frame, RuntimeError>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::try_unfold(reader, |mut reader| async move {
        let frame = read_frame(&mut reader).await?;
        Ok::<_, RuntimeError>(frame.map(|frame| (frame, reader)))
    })
    .boxed()
}

/// Per-stream accumulators fed by frames.
#[derive(Debug, Default)]
pub struct Demultiplexer {
    stdout: Vec<Bytes>,
    stderr: Vec<Bytes>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        match frame.kind {
            StreamKind::Stdout => self.stdout.push(frame.payload),
            StreamKind::Stderr => self.stderr.push(frame.payload),
            // Echoed input is not program output
            StreamKind::Stdin => {}
        }
    }

    /// Consumes frames until the channel closes.
    pub async fn drain<S>(&mut self, mut frames: S) -> Result<(), RuntimeError>
    where
        S: Stream<Item = Result<Frame, RuntimeError>> + Unpin,
    {
        while let Some(frame) = frames.next().await {
            self.push(frame?);
        }
        Ok(())
    }

    /// Concatenates the captured chunks into `(stdout, stderr)`.
    pub fn assemble(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout.concat(), self.stderr.concat())
    }
}
