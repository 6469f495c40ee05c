//! Handshake codec.
//!
//! Sent once, client to server, immediately after connecting:
//!
//! ```text
//! [MAGIC][VERSION]
//! [id_len: u8][id][secret_len: u8][secret]
//! [option]...
//! ```
//!
//! Each option starts with a marker byte whose top two bits encode the length
//! of the marker's remaining fixed-size tail, so a decoder can skip markers
//! it knows the shape but not the meaning of. One option is declared by
//! default; the `OptionAndNextOption` marker extends the sequence by two, so
//! the option list is self-delimiting and decode consumes exactly the bytes
//! that belong to it.
//!
//! Decoding is restartable: [`HandshakeError::Incomplete`] means "feed me
//! more bytes and call again", which is how the server reads a handshake off
//! a stream without framing.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    MAGIC, MAX_HOST_PREFIX_SIZE, MAX_ID_SIZE, MAX_SECRET_SIZE, MIN_HOST_PREFIX_SIZE, MIN_ID_SIZE,
    MIN_SECRET_SIZE, VERSION,
};

const OPT_ID_AS_HOST_PREFIX: u8 = 0;
const OPT_OPEN_TCP_PORT: u8 = 1;
const OPT_AND_NEXT_OPTION: u8 = 2;
const OPT_OPEN_HOST: u8 = 3;
const OPT_ID_AS_TLS_HOST_PREFIX: u8 = 4;
const OPT_OPEN_TLS_HOST: u8 = 5;

/// One declared service, in handshake order. The position of an option in
/// the decoded list is its service index, stable for the lifetime of the
/// handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceOption {
    /// Ask the server to lease a public TCP port for this service.
    OpenTcpPort { random: bool, port: u16 },
    /// Route inbound HTTP (or TLS when `tls`) requests whose first host
    /// label equals `prefix` to this service. Encoded compressed when the
    /// prefix equals the client id.
    OpenHost { prefix: String, tls: bool },
}

/// Decoded handshake payload. Host prefixes are resolved: the compressed
/// id-as-prefix forms decode to the concrete id string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub id: String,
    pub secret: String,
    pub options: Vec<ServiceOption>,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Not an error: the buffer ends before the handshake does.
    #[error("handshake incomplete, more bytes needed")]
    Incomplete,

    #[error("bad magic byte: {0:#x}")]
    BadMagic(u8),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("id length {0} outside [{MIN_ID_SIZE}, {MAX_ID_SIZE}]")]
    IdLength(usize),

    #[error("secret length {0} outside [{MIN_SECRET_SIZE}, {MAX_SECRET_SIZE}]")]
    SecretLength(usize),

    #[error("host prefix length {0} outside [{MIN_HOST_PREFIX_SIZE}, {MAX_HOST_PREFIX_SIZE}]")]
    HostPrefixLength(usize),

    #[error("invalid option marker: {0:#x}")]
    UnknownOption(u8),

    #[error("handshake exceeds {0} options")]
    TooManyOptions(u16),

    #[error("id, secret and host prefixes must be utf-8")]
    InvalidUtf8,
}

impl Handshake {
    /// Deterministic encoding, including the magic/version prelude. Rejects
    /// any field whose length does not fit its one-byte length prefix.
    pub fn encode(&self) -> Result<BytesMut, HandshakeError> {
        if self.id.len() < MIN_ID_SIZE || self.id.len() > MAX_ID_SIZE {
            return Err(HandshakeError::IdLength(self.id.len()));
        }
        if self.secret.len() < MIN_SECRET_SIZE || self.secret.len() > MAX_SECRET_SIZE {
            return Err(HandshakeError::SecretLength(self.secret.len()));
        }

        let mut buf = BytesMut::with_capacity(
            4 + self.id.len() + self.secret.len() + self.options.len() * 8,
        );
        buf.put_u8(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.id.len() as u8);
        buf.put_slice(self.id.as_bytes());
        buf.put_u8(self.secret.len() as u8);
        buf.put_slice(self.secret.as_bytes());
        encode_options(&self.id, &self.options, &mut buf)?;
        Ok(buf)
    }

    /// Decode a full handshake from `buf`, returning the value and the
    /// number of bytes consumed. Trailing bytes are left untouched for the
    /// frame loop.
    pub fn decode(buf: &[u8], max_options: u16) -> Result<(Handshake, usize), HandshakeError> {
        let mut cur = Cursor::new(buf);

        let magic = cur.u8()?;
        if magic != MAGIC {
            return Err(HandshakeError::BadMagic(magic));
        }
        let version = cur.u8()?;
        if version != VERSION {
            return Err(HandshakeError::UnsupportedVersion(version));
        }

        let id_len = cur.u8()? as usize;
        if !(MIN_ID_SIZE..=MAX_ID_SIZE).contains(&id_len) {
            return Err(HandshakeError::IdLength(id_len));
        }
        let id = utf8(cur.bytes(id_len)?)?;

        let secret_len = cur.u8()? as usize;
        if !(MIN_SECRET_SIZE..=MAX_SECRET_SIZE).contains(&secret_len) {
            return Err(HandshakeError::SecretLength(secret_len));
        }
        let secret = utf8(cur.bytes(secret_len)?)?;

        let options = decode_options_inner(&mut cur, &id, max_options)?;
        let consumed = cur.pos;
        Ok((Handshake { id, secret, options }, consumed))
    }
}

/// Encode an options sequence, compressing host prefixes that equal `id`.
/// Used by the full handshake and by the `Services` re-declaration.
pub fn encode_options(
    id: &str,
    options: &[ServiceOption],
    buf: &mut BytesMut,
) -> Result<(), HandshakeError> {
    for (i, option) in options.iter().enumerate() {
        if i != options.len() - 1 {
            buf.put_u8(OPT_AND_NEXT_OPTION);
        }
        match option {
            ServiceOption::OpenTcpPort { random, port } => {
                buf.put_u8(OPT_OPEN_TCP_PORT);
                buf.put_u8(u8::from(*random));
                buf.put_u16(*port);
            }
            ServiceOption::OpenHost { prefix, tls } => {
                if prefix == id {
                    buf.put_u8(if *tls {
                        OPT_ID_AS_TLS_HOST_PREFIX
                    } else {
                        OPT_ID_AS_HOST_PREFIX
                    });
                } else {
                    if prefix.len() < MIN_HOST_PREFIX_SIZE || prefix.len() > MAX_HOST_PREFIX_SIZE {
                        return Err(HandshakeError::HostPrefixLength(prefix.len()));
                    }
                    buf.put_u8(if *tls { OPT_OPEN_TLS_HOST } else { OPT_OPEN_HOST });
                    buf.put_u8(prefix.len() as u8);
                    buf.put_slice(prefix.as_bytes());
                }
            }
        }
    }
    Ok(())
}

/// Decode a bare options sequence (the payload of a `Services`
/// re-declaration), resolving id-as-prefix forms against `id`.
pub fn decode_options(
    buf: &[u8],
    id: &str,
    max_options: u16,
) -> Result<(Vec<ServiceOption>, usize), HandshakeError> {
    let mut cur = Cursor::new(buf);
    let options = decode_options_inner(&mut cur, id, max_options)?;
    Ok((options, cur.pos))
}

fn decode_options_inner(
    cur: &mut Cursor<'_>,
    id: &str,
    max_options: u16,
) -> Result<Vec<ServiceOption>, HandshakeError> {
    let mut options = Vec::new();
    let mut seen: u16 = 0;
    let mut left: u32 = 1;
    while left > 0 {
        if seen >= max_options {
            return Err(HandshakeError::TooManyOptions(max_options));
        }
        seen += 1;

        let marker = cur.u8()?;
        // Top two bits carry the length of the marker's fixed tail so that
        // unknown-but-well-formed markers can at least be sized.
        let tail_len = (marker >> 6) as usize;
        let _tail = cur.bytes(tail_len)?;
        if tail_len != 0 {
            return Err(HandshakeError::UnknownOption(marker));
        }

        match marker {
            OPT_AND_NEXT_OPTION => {
                left += 2;
                continue;
            }
            OPT_ID_AS_HOST_PREFIX | OPT_ID_AS_TLS_HOST_PREFIX => {
                options.push(ServiceOption::OpenHost {
                    prefix: id.to_owned(),
                    tls: marker == OPT_ID_AS_TLS_HOST_PREFIX,
                });
            }
            OPT_OPEN_HOST | OPT_OPEN_TLS_HOST => {
                let prefix_len = cur.u8()? as usize;
                if !(MIN_HOST_PREFIX_SIZE..=MAX_HOST_PREFIX_SIZE).contains(&prefix_len) {
                    return Err(HandshakeError::HostPrefixLength(prefix_len));
                }
                let prefix = utf8(cur.bytes(prefix_len)?)?;
                options.push(ServiceOption::OpenHost {
                    prefix,
                    tls: marker == OPT_OPEN_TLS_HOST,
                });
            }
            OPT_OPEN_TCP_PORT => {
                let random = cur.u8()? != 0;
                let port = cur.u16()?;
                options.push(ServiceOption::OpenTcpPort { random, port });
            }
            other => return Err(HandshakeError::UnknownOption(other)),
        }
        left -= 1;
    }
    Ok(options)
}

fn utf8(bytes: &[u8]) -> Result<String, HandshakeError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| HandshakeError::InvalidUtf8)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], HandshakeError> {
        if self.buf.len() - self.pos < n {
            return Err(HandshakeError::Incomplete);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, HandshakeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, HandshakeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}
