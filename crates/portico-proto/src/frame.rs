//! Steady-state frame format.
//!
//! Every frame starts with a big-endian `u32`. Values at or above
//! [`RESERVED_SIGNAL`] are control signals; anything else is a task id.
//! The overload lives only on the wire: decoding classifies the value once
//! into a [`FrameHeader`] and the rest of the code never compares raw
//! integers against the signal space.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Task ids wrap below this value; signal values occupy `RESERVED_SIGNAL..`.
pub const RESERVED_SIGNAL: u32 = u32::MAX - 3000;

const PING: u32 = u32::MAX;
const CLOSE: u32 = u32::MAX - 1;
const READY: u32 = u32::MAX - 2;
const ERROR: u32 = u32::MAX - 3;
const INFO: u32 = u32::MAX - 4;
const SERVICES: u32 = u32::MAX - 5;

/// Two `Close` signals back to back: the force-close sequence, sent when a
/// draining tunnel finishes its last task.
pub const FORCE_CLOSE_BYTES: [u8; 8] = [0xFF, 0xFF, 0xFF, 0xFE, 0xFF, 0xFF, 0xFF, 0xFE];

/// Control signal carried in the task-id field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ping,
    Close,
    Ready,
    Error,
    Info,
    Services,
}

impl Signal {
    pub fn wire_value(self) -> u32 {
        match self {
            Signal::Ping => PING,
            Signal::Close => CLOSE,
            Signal::Ready => READY,
            Signal::Error => ERROR,
            Signal::Info => INFO,
            Signal::Services => SERVICES,
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.wire_value().to_be_bytes()
    }
}

/// A decoded frame header: either a reserved control signal or a task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    Signal(Signal),
    Task(u32),
}

impl FrameHeader {
    /// Classify the leading `u32` of a frame.
    ///
    /// Values inside the reserved range that do not name a known signal are
    /// wire corruption (or a peer from the future) and fail fast.
    pub fn classify(value: u32) -> Result<Self, FrameError> {
        if value < RESERVED_SIGNAL {
            return Ok(FrameHeader::Task(value));
        }
        let signal = match value {
            PING => Signal::Ping,
            CLOSE => Signal::Close,
            READY => Signal::Ready,
            ERROR => Signal::Error,
            INFO => Signal::Info,
            SERVICES => Signal::Services,
            other => return Err(FrameError::UnknownSignal(other)),
        };
        Ok(FrameHeader::Signal(signal))
    }
}

/// Per-task operation, the `u16` following a task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOption {
    Data,
    Close,
    ServicesData,
}

impl TaskOption {
    pub fn wire_value(self) -> u16 {
        match self {
            TaskOption::Data => 0,
            TaskOption::Close => 1,
            TaskOption::ServicesData => 2,
        }
    }
}

impl TryFrom<u16> for TaskOption {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        match value {
            0 => Ok(TaskOption::Data),
            1 => Ok(TaskOption::Close),
            2 => Ok(TaskOption::ServicesData),
            other => Err(FrameError::UnknownTaskOption(other)),
        }
    }
}

/// Error codes carried by the `Error` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("invalid id and secret")]
    InvalidIdAndSecret,
    #[error("failed to open tcp port")]
    FailedToOpenTcpPort,
    #[error("reached the max connections")]
    ReachedMaxConnections,
    #[error("host number limited")]
    HostNumberLimited,
    #[error("host conflict")]
    HostConflict,
    #[error("host regex mismatch")]
    HostRegexMismatch,
    #[error("reached the max options")]
    ReachedMaxOptions,
    #[error("tcp number limited")]
    TcpNumberLimited,
}

impl ErrorCode {
    pub fn wire_value(self) -> u16 {
        match self {
            ErrorCode::InvalidIdAndSecret => 1,
            ErrorCode::FailedToOpenTcpPort => 2,
            ErrorCode::ReachedMaxConnections => 3,
            ErrorCode::HostNumberLimited => 4,
            ErrorCode::HostConflict => 5,
            ErrorCode::HostRegexMismatch => 6,
            ErrorCode::ReachedMaxOptions => 7,
            ErrorCode::TcpNumberLimited => 8,
        }
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(ErrorCode::InvalidIdAndSecret),
            2 => Ok(ErrorCode::FailedToOpenTcpPort),
            3 => Ok(ErrorCode::ReachedMaxConnections),
            4 => Ok(ErrorCode::HostNumberLimited),
            5 => Ok(ErrorCode::HostConflict),
            6 => Ok(ErrorCode::HostRegexMismatch),
            7 => Ok(ErrorCode::ReachedMaxOptions),
            8 => Ok(ErrorCode::TcpNumberLimited),
            other => Err(FrameError::UnknownErrorCode(other)),
        }
    }
}

/// Info codes carried by the `Info` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoCode {
    TcpPortOpened,
}

impl InfoCode {
    pub fn wire_value(self) -> u16 {
        match self {
            InfoCode::TcpPortOpened => 1,
        }
    }
}

impl TryFrom<u16> for InfoCode {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(InfoCode::TcpPortOpened),
            other => Err(FrameError::UnknownInfoCode(other)),
        }
    }
}

/// Frame decode errors. All of them are fatal to the tunnel: wire corruption
/// cannot be told apart from stream desync, so there is no recovery.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown signal value: {0:#x}")]
    UnknownSignal(u32),

    #[error("unknown task option: {0}")]
    UnknownTaskOption(u16),

    #[error("unknown error code: {0}")]
    UnknownErrorCode(u16),

    #[error("unknown info code: {0}")]
    UnknownInfoCode(u16),

    #[error("service index {index} out of range ({count} services declared)")]
    ServiceIndexOutOfRange { index: u16, count: usize },
}

/// `[task_id][Data][len]` - the payload follows.
pub fn encode_data_header(task_id: u32, len: u32) -> [u8; 10] {
    let mut buf = [0u8; 10];
    buf[0..4].copy_from_slice(&task_id.to_be_bytes());
    buf[4..6].copy_from_slice(&TaskOption::Data.wire_value().to_be_bytes());
    buf[6..10].copy_from_slice(&len.to_be_bytes());
    buf
}

/// `[task_id][ServicesData][service_index][len]` - the payload follows.
pub fn encode_services_data_header(task_id: u32, service_index: u16, len: u32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&task_id.to_be_bytes());
    buf[4..6].copy_from_slice(&TaskOption::ServicesData.wire_value().to_be_bytes());
    buf[6..8].copy_from_slice(&service_index.to_be_bytes());
    buf[8..12].copy_from_slice(&len.to_be_bytes());
    buf
}

/// `[task_id][Close]`.
pub fn encode_task_close(task_id: u32) -> [u8; 6] {
    let mut buf = [0u8; 6];
    buf[0..4].copy_from_slice(&task_id.to_be_bytes());
    buf[4..6].copy_from_slice(&TaskOption::Close.wire_value().to_be_bytes());
    buf
}

/// `Error` signal with its code, plus the service index for the per-service
/// `FailedToOpenTcpPort` variant.
pub fn encode_error(code: ErrorCode, service_index: Option<u16>) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_slice(&Signal::Error.to_bytes());
    buf.put_u16(code.wire_value());
    if let Some(index) = service_index {
        buf.put_u16(index);
    }
    buf
}

/// `Info{TcpPortOpened}` with the service index and the port that was bound.
pub fn encode_info_tcp_port_opened(service_index: u16, port: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(10);
    buf.put_slice(&Signal::Info.to_bytes());
    buf.put_u16(InfoCode::TcpPortOpened.wire_value());
    buf.put_u16(service_index);
    buf.put_u16(port);
    buf
}
