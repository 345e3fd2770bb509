//! Serial Protocol Communication
//!
//! Implements the fixed-size binary frame protocol spoken by the pump
//! controller firmware: every message is `[id][payload: 4 bytes LE][xor]`.
//!
//! Ids below 200 are register commands, 200 and up are signals sent by the
//! controller (run finished, boot, ack, errors).

pub mod commands;
mod error;
pub mod frame;
pub mod serial;
pub mod stream;
pub mod transport;

pub use commands::{Access, CommandEntry, CommandTable, Incoming, Parameter, COMMAND_TABLE};
pub use error::ProtocolError;
pub use frame::{Frame, PayloadWidth};
pub use serial::{list_ports, open_port, PortInfo};
pub use stream::{CommunicationChannel, SerialChannel};
pub use transport::{FinishedHandler, Transport, TransportConfig, TransportStats};

/// Size of one frame on the wire
pub const FRAME_LEN: usize = 6;

/// Payload bytes inside a frame
pub const PAYLOAD_LEN: usize = 4;

/// Motor channels on one controller
pub const CHANNEL_COUNT: usize = 4;

/// Default baud rate for the controller
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for replies in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default read timeout between bytes of a frame in milliseconds
pub const DEFAULT_INTER_BYTE_TIMEOUT_MS: u64 = 500;

/// Inter-byte timeouts to wait after the controller reports a checksum error
pub const DEFAULT_CHECKSUM_BACKOFF_FACTOR: u32 = 2;

/// Delay after opening the port before the controller accepts commands (it resets on open)
pub const DEFAULT_CONNECT_DELAY_MS: u64 = 3000;
