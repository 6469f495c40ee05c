//! Shared write half, close-state machine, and the buffered frame reader.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use portico_proto::frame::{
    encode_error, encode_info_tcp_port_opened, ErrorCode, Signal, FORCE_CLOSE_BYTES,
};

use crate::BoxedStream;

/// Close reason: closed by this side.
pub const CLOSED_LOCAL: u32 = 1;
/// Close reason: the peer closed the stream or sent a task close.
pub const CLOSED_BY_REMOTE: u32 = 2;

/// The shared side of a tunnel connection: the write half behind a mutex so
/// frames from the read loop and every task pump never interleave, plus the
/// close-state machine.
pub struct Connection {
    writer: Mutex<WriteHalf<BoxedStream>>,
    closing: AtomicU32,
    draining: AtomicBool,
    cancel: CancellationToken,
    write_timeout: Duration,
}

impl Connection {
    /// Split a stream into the shared write side and the exclusive reader.
    pub fn split(stream: BoxedStream, write_timeout: Duration) -> (Arc<Connection>, FrameReader) {
        let (read_half, write_half) = tokio::io::split(stream);
        let conn = Arc::new(Connection {
            writer: Mutex::new(write_half),
            closing: AtomicU32::new(0),
            draining: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            write_timeout,
        });
        (conn, FrameReader::new(read_half))
    }

    /// Write one frame. Holding the lock across the whole buffer is what
    /// keeps frames from interleaving; callers pass complete frames only.
    pub async fn write(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        if self.write_timeout > Duration::ZERO {
            tokio::time::timeout(self.write_timeout, write)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
        } else {
            write.await
        }
    }

    /// Write a data frame header and its payload as one locked sequence.
    pub async fn write_frame(&self, header: &[u8], payload: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(header).await?;
            writer.write_all(payload).await?;
            writer.flush().await
        };
        if self.write_timeout > Duration::ZERO {
            tokio::time::timeout(self.write_timeout, write)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
        } else {
            write.await
        }
    }

    pub async fn send_ping(&self) -> io::Result<()> {
        self.write(&Signal::Ping.to_bytes()).await
    }

    pub async fn send_close(&self) -> io::Result<()> {
        self.write(&Signal::Close.to_bytes()).await
    }

    /// Two close signals back to back; the peer reads the second while
    /// already draining and tears down immediately.
    pub async fn send_force_close(&self) -> io::Result<()> {
        self.write(&FORCE_CLOSE_BYTES).await
    }

    pub async fn send_ready(&self) -> io::Result<()> {
        self.write(&Signal::Ready.to_bytes()).await
    }

    pub async fn send_services(&self, options: &[u8]) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(4 + options.len());
        buf.extend_from_slice(&Signal::Services.to_bytes());
        buf.extend_from_slice(options);
        self.write(&buf).await
    }

    pub async fn send_error(&self, code: ErrorCode, service_index: Option<u16>) -> io::Result<()> {
        self.write(&encode_error(code, service_index)).await
    }

    pub async fn send_info_tcp_port_opened(&self, service_index: u16, port: u16) -> io::Result<()> {
        self.write(&encode_info_tcp_port_opened(service_index, port))
            .await
    }

    /// Tear down the stream, recording a local close. Idempotent.
    pub async fn close(&self) {
        self.close_with(CLOSED_LOCAL).await;
    }

    /// Tear down the stream, recording that the peer closed first.
    pub async fn close_by_remote(&self) {
        self.close_with(CLOSED_BY_REMOTE).await;
    }

    async fn close_with(&self, value: u32) {
        if self
            .closing
            .compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(%err, "stream shutdown");
        }
    }

    /// Mark the connection as draining: no new tasks should start, existing
    /// ones run to completion before the stream is torn down.
    pub fn mark_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire) != 0
    }

    pub fn is_closed_by_remote(&self) -> bool {
        self.closing.load(Ordering::Acquire) == CLOSED_BY_REMOTE
    }

    /// Token cancelled when the connection is torn down; read loops and
    /// pumps select against it so a close from any side unblocks them.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Copy failure split by side, so callers can tell "the source died" (fatal
/// to the tunnel) from "the destination died" (fatal to one task only).
#[derive(Debug)]
pub enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

/// Buffered reader over the exclusive read half with explicit peek/consume,
/// the shape the protocol wants: classify four bytes, then commit.
pub struct FrameReader {
    inner: ReadHalf<BoxedStream>,
    buf: BytesMut,
}

const READ_CHUNK: usize = 32 * 1024;

impl FrameReader {
    fn new(inner: ReadHalf<BoxedStream>) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// A reader over a closed stream: buffered bytes only, then EOF. Useful
    /// as the leftover when a real reader is moved out of a struct.
    pub fn detached() -> Self {
        let (stream, _closed) = tokio::io::duplex(1);
        let (read_half, _) = tokio::io::split(Box::new(stream) as BoxedStream);
        Self::new(read_half)
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Read more bytes from the stream into the buffer. `Ok(0)` never
    /// escapes: end of stream is `UnexpectedEof`.
    pub async fn fill(&mut self) -> io::Result<usize> {
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(n)
    }

    /// Peek `n` bytes without consuming them.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            self.fill().await?;
        }
        Ok(&self.buf[..n])
    }

    pub async fn read_u8(&mut self) -> io::Result<u8> {
        let b = self.peek(1).await?[0];
        self.consume(1);
        Ok(b)
    }

    pub async fn read_u16(&mut self) -> io::Result<u16> {
        let b = self.peek(2).await?;
        let v = u16::from_be_bytes([b[0], b[1]]);
        self.consume(2);
        Ok(v)
    }

    pub async fn read_u32(&mut self) -> io::Result<u32> {
        let b = self.peek(4).await?;
        let v = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        self.consume(4);
        Ok(v)
    }

    /// Read up to `max` bytes, serving buffered bytes first. Used by task
    /// pumps where chunk boundaries do not matter.
    pub async fn read_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        if self.buf.is_empty() {
            self.fill().await?;
        }
        let n = self.buf.len().min(max);
        Ok(self.buf.split_to(n).freeze())
    }

    /// Take whatever is buffered without touching the stream. May be empty.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Stream exactly `n` bytes into `dst`.
    ///
    /// A write failure does not poison the stream: the remaining payload is
    /// drained so the reader stays frame-aligned, and the error is reported
    /// as [`CopyError::Write`]. A read failure is [`CopyError::Read`] and
    /// the stream position is undefined - the tunnel must die.
    pub async fn copy_limited<W>(&mut self, mut n: u64, dst: &mut W) -> Result<(), CopyError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        while n > 0 {
            if self.buf.is_empty() {
                self.fill().await.map_err(CopyError::Read)?;
            }
            let take = (self.buf.len() as u64).min(n) as usize;
            let chunk = self.buf.split_to(take);
            n -= take as u64;
            if let Err(err) = dst.write_all(&chunk).await {
                self.discard(n).await.map_err(CopyError::Read)?;
                return Err(CopyError::Write(err));
            }
        }
        dst.flush().await.map_err(CopyError::Write)
    }

    /// Drop exactly `n` bytes from the stream.
    pub async fn discard(&mut self, mut n: u64) -> io::Result<()> {
        while n > 0 {
            if self.buf.is_empty() {
                self.fill().await?;
            }
            let take = (self.buf.len() as u64).min(n) as usize;
            self.buf.advance(take);
            n -= take as u64;
        }
        Ok(())
    }
}
