//! Tunnel connection plumbing.
//!
//! One physical tunnel connection is an opaque duplex byte stream split into
//! an exclusively-owned read half ([`FrameReader`]) and a mutex-serialized
//! write half ([`Connection`]). The protocol is transport agnostic above
//! this line: TCP and TLS are provided, anything else implementing
//! [`TunnelStream`] plugs in.

pub mod connection;
pub mod dial;

pub use connection::{Connection, CopyError, FrameReader, CLOSED_BY_REMOTE, CLOSED_LOCAL};
pub use dial::{DialError, Dialer, Remote, TlsOptions};

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that can carry the tunnel protocol: a bidirectional byte stream
/// with shutdown. TCP, TLS, and in-memory duplex pipes in tests all qualify.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// Boxed [`TunnelStream`], the form everything downstream works with.
pub type BoxedStream = Box<dyn TunnelStream>;
