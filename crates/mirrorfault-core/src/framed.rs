//! Deadline-bounded frame reads.
//!
//! A frame read collects bytes until the frame is complete, the peer
//! closes, or the deadline passes. Anything short of a complete frame is
//! [`FaultError::FrameIncomplete`], carrying how many bytes did arrive.

use std::io;

use bytes::{Bytes, BytesMut};
use mirrorfault_proto::{FrameKind, HandshakeFrame, RequestFrame, ResponseFrame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{FaultError, Result},
    guard::Deadline,
};

/// Why a bounded fill stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillEnd {
    /// All requested bytes arrived.
    Complete,
    /// The peer closed (or reset) the connection first.
    Closed,
    /// The deadline passed first.
    Elapsed,
}

/// Read up to `len` bytes, stopping at close or `deadline`.
///
/// Returns whatever arrived together with the reason reading stopped.
/// Socket errors other than a reset are returned as errors.
pub async fn fill_within<R>(
    reader: &mut R,
    len: usize,
    deadline: Deadline,
) -> Result<(Bytes, FillEnd)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(len);
    let mut filled = 0;
    let mut end = FillEnd::Complete;

    while filled < len {
        match tokio::time::timeout_at(deadline, reader.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => {
                end = FillEnd::Closed;
                break;
            },
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {},
            Ok(Err(e)) if is_disconnect(&e) => {
                end = FillEnd::Closed;
                break;
            },
            Ok(Err(e)) => return Err(FaultError::Io(e)),
            Err(_) => {
                end = FillEnd::Elapsed;
                break;
            },
        }
    }

    if end != FillEnd::Complete {
        tracing::debug!(filled, len, ?end, "read stopped short");
    }
    buf.truncate(filled);
    Ok((buf.freeze(), end))
}

/// Read exactly one frame of `kind`.
pub async fn read_frame<R>(reader: &mut R, kind: FrameKind, deadline: Deadline) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let (bytes, end) = fill_within(reader, kind.size(), deadline).await?;
    match end {
        FillEnd::Complete => Ok(bytes),
        FillEnd::Closed | FillEnd::Elapsed => Err(FaultError::FrameIncomplete {
            frame: kind,
            expected: kind.size(),
            received: bytes.len(),
        }),
    }
}

/// Read a 152-byte handshake.
pub async fn decode_handshake<R>(reader: &mut R, deadline: Deadline) -> Result<HandshakeFrame>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_frame(reader, FrameKind::Handshake, deadline).await?;
    Ok(HandshakeFrame::decode(&bytes)?)
}

/// Read a 16-byte response.
pub async fn decode_response<R>(reader: &mut R, deadline: Deadline) -> Result<ResponseFrame>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_frame(reader, FrameKind::Response, deadline).await?;
    Ok(ResponseFrame::decode(&bytes)?)
}

/// Read a 28-byte request.
pub async fn decode_request<R>(reader: &mut R, deadline: Deadline) -> Result<RequestFrame>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_frame(reader, FrameKind::Request, deadline).await?;
    Ok(RequestFrame::decode(&bytes)?)
}

/// Read a payload of `len` bytes and hand it back.
pub async fn read_payload<R>(reader: &mut R, len: usize, deadline: Deadline) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let (bytes, end) = fill_within(reader, len, deadline).await?;
    if end == FillEnd::Complete {
        Ok(bytes)
    } else {
        Err(FaultError::PayloadIncomplete { expected: len as u64, received: bytes.len() as u64 })
    }
}

/// Consume `len` payload bytes without keeping them.
pub async fn discard_payload<R>(reader: &mut R, len: u64, deadline: Deadline) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut limited = reader.take(len);
    let mut sink = tokio::io::sink();
    let copy = tokio::io::copy(&mut limited, &mut sink);
    let finished = tokio::time::timeout_at(deadline, copy).await;
    let copied = match finished {
        Ok(Ok(n)) => n,
        Ok(Err(e)) if is_disconnect(&e) => len - limited.limit(),
        Ok(Err(e)) => return Err(FaultError::Io(e)),
        Err(_) => len - limited.limit(),
    };

    if copied == len {
        Ok(())
    } else {
        Err(FaultError::PayloadIncomplete { expected: len, received: copied })
    }
}

/// Discard input until the peer closes or `deadline` passes.
///
/// Returns whether the peer closed.
pub async fn drain_until_close<R>(reader: &mut R, deadline: Deadline) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 4096];
    loop {
        match tokio::time::timeout_at(deadline, reader.read(&mut scratch)).await {
            Ok(Ok(0)) => return Ok(true),
            Ok(Ok(n)) => tracing::debug!(n, "discarded input while waiting for close"),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {},
            Ok(Err(e)) if is_disconnect(&e) => return Ok(true),
            Ok(Err(e)) => return Err(FaultError::Io(e)),
            Err(_) => return Ok(false),
        }
    }
}

/// Write `len` zero bytes, as the data of a READ reply.
///
/// Blocks for as long as the peer does not read; callers bound it.
pub async fn write_zeroes<W>(writer: &mut W, len: u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut zeroes = tokio::io::repeat(0).take(len);
    tokio::io::copy(&mut zeroes, writer).await?;
    Ok(())
}

/// Write all of `bytes` and flush.
pub async fn write_flush<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
