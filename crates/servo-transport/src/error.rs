use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("port not found: {0}")]
    PortNotFound(String),
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),
    #[error("checksum mismatch (expected 0x{expected:04X}, got 0x{actual:04X})")]
    Checksum { expected: u16, actual: u16 },
    #[error("device {id} reported status error 0x{code:02X}")]
    DeviceStatus { id: u8, code: u8 },
}

impl TransportError {
    /// True for failures that only mean "nobody answered".
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}
