//! Tunnel Wire Protocol
//!
//! This crate defines the byte-level protocol spoken between the portico
//! client and server: the one-shot handshake sent when a tunnel connection is
//! established, and the steady-state frame format that multiplexes proxied
//! tasks and control signals over a single stream.
//!
//! Everything here is pure encode/decode over byte buffers; stream adapters
//! live in `portico-connection`.

pub mod frame;
pub mod handshake;

pub use frame::{
    ErrorCode, FrameHeader, InfoCode, Signal, TaskOption, FORCE_CLOSE_BYTES, RESERVED_SIGNAL,
};
pub use handshake::{Handshake, HandshakeError, ServiceOption};

/// First byte of every tunnel connection. Lets a server multiplexing tunnel
/// and plain proxied traffic on one listener tell them apart.
pub const MAGIC: u8 = 0xF0;

/// Protocol version byte, sent immediately after [`MAGIC`].
pub const VERSION: u8 = 0x01;

/// Minimum length of a client id.
pub const MIN_ID_SIZE: usize = 1;

/// Maximum length of a client id.
pub const MAX_ID_SIZE: usize = 200;

/// Minimum length of a client secret.
pub const MIN_SECRET_SIZE: usize = MIN_ID_SIZE;

/// Maximum length of a client secret.
pub const MAX_SECRET_SIZE: usize = MAX_ID_SIZE;

/// Minimum length of a host prefix.
pub const MIN_HOST_PREFIX_SIZE: usize = MIN_ID_SIZE;

/// Maximum length of a host prefix.
pub const MAX_HOST_PREFIX_SIZE: usize = MAX_ID_SIZE;

/// Default cap on the number of options a single handshake may carry.
pub const DEFAULT_MAX_HANDSHAKE_OPTIONS: u16 = 30;

/// Max bytes scanned when peeking HTTP headers for routing.
pub const MAX_HTTP_HEADER_SIZE: usize = 2 * 1024;
