//! Frame encoding/decoding
//!
//! Every message exchanged with the pump controller is exactly one frame:
//! - 1 byte: command or signal id
//! - 4 bytes: payload (little-endian, 1 or 4 significant bytes)
//! - 1 byte: XOR of the five preceding bytes
//!
//! There is no escaping and no length prefix. Loss of synchronization shows
//! up only as a checksum failure.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{ErrorKind, Read};

use super::{ProtocolError, FRAME_LEN, PAYLOAD_LEN};

/// Number of significant payload bytes carried by a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadWidth {
    /// Single byte flag or small integer
    OneByte,
    /// 32-bit little-endian integer
    FourBytes,
}

impl PayloadWidth {
    /// Number of payload bytes used by this width
    pub const fn len(self) -> usize {
        match self {
            PayloadWidth::OneByte => 1,
            PayloadWidth::FourBytes => 4,
        }
    }
}

/// A single protocol frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Command or signal id
    pub id: u8,
    /// Raw payload bytes
    pub payload: [u8; PAYLOAD_LEN],
}

impl Frame {
    /// Create a frame from raw parts
    pub const fn new(id: u8, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self { id, payload }
    }

    /// Create a frame with an empty payload (get requests and signals)
    pub const fn command(id: u8) -> Self {
        Self {
            id,
            payload: [0; PAYLOAD_LEN],
        }
    }

    /// Create a frame carrying `value`, truncated to the declared width
    pub fn with_value(id: u8, width: PayloadWidth, value: u32) -> Self {
        let mut full = [0u8; PAYLOAD_LEN];
        LittleEndian::write_u32(&mut full, value);

        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..width.len()].copy_from_slice(&full[..width.len()]);
        Self { id, payload }
    }

    /// Decode the payload according to the declared width
    pub fn value(&self, width: PayloadWidth) -> u32 {
        match width {
            PayloadWidth::OneByte => self.payload[0] as u32,
            PayloadWidth::FourBytes => LittleEndian::read_u32(&self.payload),
        }
    }

    /// XOR checksum of id and payload
    pub fn checksum(&self) -> u8 {
        self.payload.iter().fold(self.id, |acc, b| acc ^ b)
    }

    /// Encode to wire bytes
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[0] = self.id;
        bytes[1..FRAME_LEN - 1].copy_from_slice(&self.payload);
        bytes[FRAME_LEN - 1] = self.checksum();
        bytes
    }

    /// Decode wire bytes, validating the checksum
    pub fn from_bytes(data: &[u8; FRAME_LEN]) -> Result<Self, ProtocolError> {
        let expected = checksum(&data[..FRAME_LEN - 1]);
        let actual = data[FRAME_LEN - 1];
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&data[1..FRAME_LEN - 1]);
        Ok(Self {
            id: data[0],
            payload,
        })
    }
}

/// XOR checksum over a byte slice
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Read one raw frame from a byte stream.
///
/// The reader is expected to be configured with the inter-byte timeout.
/// Returns `Ok(None)` when the line is idle (timeout before the first byte),
/// `IncompleteFrame` when the stream stalls mid-frame and `ConnectionClosed`
/// on end of stream.
pub fn read_frame<R: Read + ?Sized>(
    reader: &mut R,
) -> Result<Option<[u8; FRAME_LEN]>, ProtocolError> {
    let mut buf = [0u8; FRAME_LEN];
    let mut filled = 0;

    while filled < FRAME_LEN {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(ProtocolError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::IncompleteFrame {
                    received: filled,
                    expected: FRAME_LEN,
                });
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    #[test]
    fn test_frame_layout() {
        let frame = Frame::with_value(7, PayloadWidth::FourBytes, 25_000);
        let bytes = frame.to_bytes();

        assert_eq!(bytes[0], 7);
        assert_eq!(&bytes[1..5], &25_000u32.to_le_bytes());
        assert_eq!(bytes[5], 7 ^ 0xA8 ^ 0x61);
    }

    #[test]
    fn test_one_byte_width_truncates() {
        let frame = Frame::with_value(1, PayloadWidth::OneByte, 0x1234);
        assert_eq!(frame.payload, [0x34, 0, 0, 0]);
        assert_eq!(frame.value(PayloadWidth::OneByte), 0x34);
    }

    #[test]
    fn test_checksum_verification() {
        let mut bytes = Frame::with_value(3, PayloadWidth::FourBytes, 200).to_bytes();
        bytes[2] ^= 0x01;

        match Frame::from_bytes(&bytes) {
            Err(ProtocolError::ChecksumMismatch { actual, .. }) => assert_eq!(actual, bytes[5]),
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_read_frame_idle() {
        struct Idle;
        impl Read for Idle {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(ErrorKind::TimedOut, "idle"))
            }
        }

        assert!(matches!(read_frame(&mut Idle), Ok(None)));
    }

    #[test]
    fn test_read_frame_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_read_frame_complete() {
        let bytes = Frame::with_value(253, PayloadWidth::OneByte, 0).to_bytes();
        let mut cursor = Cursor::new(bytes.to_vec());
        let read = read_frame(&mut cursor).expect("read").expect("frame");
        assert_eq!(read, bytes);
    }
}
