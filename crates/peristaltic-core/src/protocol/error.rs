//! Protocol errors

use thiserror::Error;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Connection closed by device")]
    ConnectionClosed,

    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Incomplete frame: received {received} of {expected} bytes")]
    IncompleteFrame { received: usize, expected: usize },

    #[error("Device rejected command {command}")]
    CommandRejected { command: u8 },

    #[error("Device reported a checksum error on the last frame")]
    DeviceChecksumError,

    #[error("Unexpected response: expected id {expected}, got {actual}")]
    UnexpectedResponse { expected: u8, actual: u8 },

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
