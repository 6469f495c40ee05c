//! One proxied stream on the client side.
//!
//! A task owns the connection to the real local service. Bytes arriving
//! from the tunnel are written into it (optionally through the `Host:`
//! header rewriter); a pump reads the service's response and frames it back
//! onto the tunnel under the same task id.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use portico_connection::{CopyError, FrameReader, CLOSED_BY_REMOTE, CLOSED_LOCAL};

const MAX_HOST_LEN: usize = 200;
const CHUNK: usize = 32 * 1024;

#[derive(Debug, Error)]
#[error("host is too long")]
pub struct HostTooLong;

/// Byte-level `Host:` header replacement.
///
/// The incoming request is forwarded verbatim except for the first line
/// starting with the literal bytes `Host:`, which is replaced by a
/// preassembled header. A potential match can span a write boundary, so up
/// to four bytes are buffered until the prefix is disambiguated.
pub struct HostRewriter {
    replacement: Vec<u8>,
    state: RewriteState,
    hold: Vec<u8>,
    active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RewriteState {
    LineStart,
    Passing,
    Skipping,
}

const HOST: &[u8] = b"Host:";

impl HostRewriter {
    pub fn new(host: &str) -> Result<Self, HostTooLong> {
        if host.len() > MAX_HOST_LEN {
            return Err(HostTooLong);
        }
        let mut replacement = Vec::with_capacity(8 + host.len());
        replacement.extend_from_slice(b"Host: ");
        replacement.extend_from_slice(host.as_bytes());
        replacement.extend_from_slice(b"\r\n");
        Ok(Self {
            replacement,
            state: RewriteState::LineStart,
            hold: Vec::new(),
            active: true,
        })
    }

    /// Transform one chunk. Output may be shorter (held prefix, skipped
    /// header) or longer (replacement emitted) than the input.
    pub fn process(&mut self, input: &[u8]) -> Vec<u8> {
        if !self.active {
            return input.to_vec();
        }

        let data: Vec<u8> = if self.hold.is_empty() {
            input.to_vec()
        } else {
            let mut combined = std::mem::take(&mut self.hold);
            combined.extend_from_slice(input);
            combined
        };

        let mut out = Vec::with_capacity(data.len() + self.replacement.len());
        let mut i = 0;
        while i < data.len() {
            match self.state {
                RewriteState::Passing => match find_newline(&data[i..]) {
                    Some(nl) => {
                        out.extend_from_slice(&data[i..=i + nl]);
                        i += nl + 1;
                        self.state = RewriteState::LineStart;
                    }
                    None => {
                        out.extend_from_slice(&data[i..]);
                        return out;
                    }
                },
                RewriteState::Skipping => match find_newline(&data[i..]) {
                    Some(nl) => {
                        i += nl + 1;
                        self.state = RewriteState::LineStart;
                        self.active = false;
                        // The header is replaced; everything else passes.
                        out.extend_from_slice(&data[i..]);
                        return out;
                    }
                    None => return out,
                },
                RewriteState::LineStart => {
                    let rest = &data[i..];
                    let probe = rest.len().min(HOST.len());
                    if rest[..probe] == HOST[..probe] {
                        if probe < HOST.len() {
                            // Possible match cut off by the chunk boundary.
                            self.hold = rest.to_vec();
                            return out;
                        }
                        out.extend_from_slice(&self.replacement);
                        self.state = RewriteState::Skipping;
                    } else {
                        self.state = RewriteState::Passing;
                    }
                }
            }
        }
        out
    }
}

fn find_newline(data: &[u8]) -> Option<usize> {
    data.iter().position(|b| *b == b'\n')
}

struct TaskWriter {
    half: OwnedWriteHalf,
    rewriter: Option<HostRewriter>,
}

/// Client-side task handle: the write side of the local service connection
/// plus the close-state machine shared with the pump.
pub struct HttpTask {
    writer: Mutex<TaskWriter>,
    closing: AtomicU32,
    cancel: CancellationToken,
    /// Millis since `epoch` of the last tunnel->local write, used to stretch
    /// the local read deadline while traffic is one-directional.
    activity: AtomicU64,
    epoch: Instant,
}

impl HttpTask {
    /// Wrap a freshly dialed local connection. Returns the task handle and
    /// the read half the pump will drain.
    pub fn new(
        stream: TcpStream,
        rewrite_host: Option<&str>,
    ) -> Result<(Arc<HttpTask>, OwnedReadHalf), HostTooLong> {
        let (read_half, write_half) = stream.into_split();
        let rewriter = rewrite_host.map(HostRewriter::new).transpose()?;
        let task = Arc::new(HttpTask {
            writer: Mutex::new(TaskWriter {
                half: write_half,
                rewriter,
            }),
            closing: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            activity: AtomicU64::new(0),
            epoch: Instant::now(),
        });
        Ok((task, read_half))
    }

    /// Stream exactly `len` payload bytes from the tunnel into the local
    /// service, applying the header rewrite when configured.
    ///
    /// A dead local socket is a task-level failure: the remaining payload is
    /// drained so the tunnel stays frame-aligned and `CopyError::Write` is
    /// returned. A tunnel read failure is `CopyError::Read` and fatal to the
    /// caller.
    pub async fn write_payload(
        &self,
        reader: &mut FrameReader,
        len: u64,
    ) -> Result<(), CopyError> {
        let mut guard = self.writer.lock().await;
        let writer = &mut *guard;
        match &mut writer.rewriter {
            None => reader.copy_limited(len, &mut writer.half).await?,
            Some(rewriter) => {
                let mut remaining = len;
                while remaining > 0 {
                    let chunk = reader
                        .read_chunk(remaining.min(CHUNK as u64) as usize)
                        .await
                        .map_err(CopyError::Read)?;
                    remaining -= chunk.len() as u64;
                    let out = rewriter.process(&chunk);
                    if let Err(err) = writer.half.write_all(&out).await {
                        reader.discard(remaining).await.map_err(CopyError::Read)?;
                        return Err(CopyError::Write(err));
                    }
                }
            }
        }
        self.touch();
        Ok(())
    }

    pub fn touch(&self) {
        self.activity
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last tunnel->local write.
    pub fn idle_for(&self) -> std::time::Duration {
        let last = self.activity.load(Ordering::Relaxed);
        self.epoch.elapsed() - std::time::Duration::from_millis(last)
    }

    pub async fn close(&self) {
        self.close_with(CLOSED_LOCAL).await;
    }

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
        if let Err(err) = writer.half.shutdown().await {
            debug!(%err, "local service shutdown");
        }
    }

    pub fn is_closed_by_remote(&self) -> bool {
        self.closing.load(Ordering::Acquire) == CLOSED_BY_REMOTE
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire) != 0
    }

    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Dial the local service behind `addr`, retrying transient failures.
pub async fn dial_local(addr: &str, attempts: usize) -> io::Result<TcpStream> {
    let mut last = None;
    for _ in 0..attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(err) => last = Some(err),
        }
    }
    Err(last.unwrap_or_else(|| io::ErrorKind::NotConnected.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite_all(rewriter: &mut HostRewriter, chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(rewriter.process(chunk));
        }
        out
    }

    #[test]
    fn rewrites_host_header() {
        let mut r = HostRewriter::new("127.0.0.1:3000").unwrap();
        let out = rewrite_all(
            &mut r,
            &[b"GET / HTTP/1.1\r\nHost: myid.example.com\r\nAccept: */*\r\n\r\n"],
        );
        assert_eq!(
            out,
            b"GET / HTTP/1.1\r\nHost: 127.0.0.1:3000\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn passes_through_without_host_header() {
        let mut r = HostRewriter::new("local:80").unwrap();
        let input: &[u8] = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\nbody";
        assert_eq!(rewrite_all(&mut r, &[input]), input);
    }

    #[test]
    fn handles_host_split_across_chunks() {
        for cut in 1..20 {
            let request = b"GET / HTTP/1.1\r\nHost: a.example.com\r\nX: y\r\n\r\n";
            let mut r = HostRewriter::new("srv:8080").unwrap();
            let (a, b) = request.split_at(cut);
            let out = rewrite_all(&mut r, &[a, b]);
            assert_eq!(
                out,
                b"GET / HTTP/1.1\r\nHost: srv:8080\r\nX: y\r\n\r\n",
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn handles_byte_at_a_time_delivery() {
        let request = b"POST /x HTTP/1.1\r\nHost: h\r\n\r\nHost: not-a-header";
        let mut r = HostRewriter::new("svc:1").unwrap();
        let chunks: Vec<&[u8]> = request.chunks(1).collect();
        let out = rewrite_all(&mut r, &chunks);
        // Only the header line is replaced; the body copy is untouched.
        assert_eq!(out, b"POST /x HTTP/1.1\r\nHost: svc:1\r\n\r\nHost: not-a-header");
    }

    #[test]
    fn only_first_host_line_is_replaced() {
        let mut r = HostRewriter::new("svc:1").unwrap();
        let out = rewrite_all(&mut r, &[b"Host: a\r\nHost: b\r\n"]);
        assert_eq!(out, b"Host: svc:1\r\nHost: b\r\n");
    }

    #[test]
    fn mid_line_host_is_not_touched() {
        let mut r = HostRewriter::new("svc:1").unwrap();
        let out = rewrite_all(&mut r, &[b"X-Forwarded-Host: a\r\n\r\n"]);
        assert_eq!(out, b"X-Forwarded-Host: a\r\n\r\n");
    }

    #[test]
    fn rejects_over_long_host() {
        assert!(HostRewriter::new(&"x".repeat(MAX_HOST_LEN + 1)).is_err());
    }
}
