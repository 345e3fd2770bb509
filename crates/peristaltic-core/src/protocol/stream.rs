//! Byte links to the controller

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use super::ProtocolError;

/// Duplex byte link to a pump controller
///
/// [`Transport`](super::Transport) splits a link in two with `try_clone`:
/// the receiver thread reads from the clone while requests are written
/// through the original.
pub trait CommunicationChannel: Read + Write + Send {
    /// Read timeout, used as the inter-byte timeout
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Drop unread input, e.g. boot chatter
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Second handle to the same link
    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>>;
}

/// Controller link over a serial port
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }

    /// Open and wrap a port, see [`open_port`](super::open_port)
    pub fn open(
        name: &str,
        baud_rate: Option<u32>,
        inter_byte_timeout: Option<Duration>,
    ) -> Result<Self, ProtocolError> {
        super::open_port(name, baud_rate, inter_byte_timeout).map(Self::new)
    }

    pub fn port_name(&self) -> Option<String> {
        self.port.name()
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl CommunicationChannel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        Ok(self.port.set_timeout(timeout)?)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        Ok(self.port.clear(serialport::ClearBuffer::Input)?)
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        let reader = self.port.try_clone()?;
        Ok(Box::new(SerialChannel::new(reader)))
    }
}
