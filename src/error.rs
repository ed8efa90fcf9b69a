//! Error kinds of the ISP engine.
use thiserror::Error;

use crate::session::SessionState;

/// Convenient result type for the ISP engine.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport timed out")]
    TransportTimeout,

    #[error("transport I/O error: {0}")]
    TransportIo(String),

    #[error("response opcode mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    ProtocolMismatch { expected: u8, actual: u8 },

    #[error("device reported error 0x{status:02x} for command 0x{opcode:02x}")]
    DeviceError { opcode: u8, status: u8 },

    #[error("length mismatch for command 0x{opcode:02x}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        opcode: u8,
        expected: usize,
        actual: usize,
    },

    #[error("config mask mismatch: requested 0x{expected:04x}, device echoed 0x{actual:04x}")]
    ConfigMaskMismatch { expected: u16, actual: u16 },

    #[error("no device answered the identify request")]
    NoDevice,

    #[error("ISP key handshake failed: expected ack 0x{expected:02x}, got 0x{actual:02x}")]
    KeyHandshakeFailed { expected: u8, actual: u8 },

    #[error("erase of {sectors} sectors failed: {}", hex::encode(.status))]
    EraseFailed { sectors: u32, status: [u8; 2] },

    #[error("program failed at 0x{address:08x}: {}", hex::encode(.status))]
    ProgramFailed { address: u32, status: [u8; 2] },

    #[error("verify failed at 0x{address:08x}: {}", hex::encode(.status))]
    VerifyFailed { address: u32, status: [u8; 2] },

    #[error("unknown register or field name `{0}`")]
    UnknownFieldName(String),

    #[error("field `{field}` truncated: 0x{requested:x} -> 0x{applied:x}")]
    FieldTruncated {
        field: String,
        requested: u32,
        applied: u32,
    },

    #[error("unknown device: type 0x{device_type:02x}, id 0x{chip_id:02x}")]
    UnknownDevice { device_type: u8, chip_id: u8 },

    #[error("image of {size} bytes does not fit in {flash_size} bytes of flash")]
    ImageTooLarge { size: usize, flash_size: u32 },

    #[error("payload of {len} bytes is too large for command 0x{opcode:02x}")]
    PayloadTooLarge { opcode: u8, len: usize },

    #[error("invalid assignment: {0}")]
    InvalidAssignment(String),

    #[error("invalid session state: expected {expected:?}, current {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("invalid key challenge: {0}")]
    InvalidChallenge(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("device database: {0}")]
    Database(String),

    #[error(transparent)]
    Encoding(#[from] scroll::Error),
}

impl Error {
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn invalid_assignment(msg: impl Into<String>) -> Self {
        Self::InvalidAssignment(msg.into())
    }

    /// Recoverable conditions that only lower the exit status.
    pub fn is_warning(&self) -> bool {
        matches!(self, Error::FieldTruncated { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Error::TransportTimeout,
            _ => Error::TransportIo(e.to_string()),
        }
    }
}

impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => Error::TransportTimeout,
            e => Error::TransportIo(e.to_string()),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut) => Error::TransportTimeout,
            _ => Error::TransportIo(e.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Database(e.to_string())
    }
}
