//! Serial port discovery and setup
//!
//! The controller enumerates as a USB CDC or USB-serial device and talks
//! 8N1 without flow control.

use std::time::Duration;

use serialport::{SerialPort, SerialPortType};
use tracing::debug;

use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_INTER_BYTE_TIMEOUT_MS};

/// USB vendor ids of boards and bridges the controller ships on
const CONTROLLER_VENDOR_IDS: [u16; 4] = [
    0x2341, // Arduino
    0x1A86, // WCH CH340
    0x0403, // FTDI
    0x2E8A, // Raspberry Pi
];

/// A serial port found on this machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Name to open, e.g. "/dev/ttyACM0" or "COM3"
    pub name: String,
    /// USB vendor and product id
    pub usb_id: Option<(u16, u16)>,
    pub serial_number: Option<String>,
    pub product: Option<String>,
}

impl PortInfo {
    /// USB device from a vendor known to carry pump controllers
    pub fn is_likely_controller(&self) -> bool {
        self.usb_id
            .map(|(vid, _)| CONTROLLER_VENDOR_IDS.contains(&vid))
            .unwrap_or(false)
    }
}

fn port_info(info: serialport::SerialPortInfo) -> PortInfo {
    match info.port_type {
        SerialPortType::UsbPort(usb) => PortInfo {
            name: info.port_name,
            usb_id: Some((usb.vid, usb.pid)),
            serial_number: usb.serial_number,
            product: usb.product,
        },
        _ => PortInfo {
            name: info.port_name,
            usb_id: None,
            serial_number: None,
            product: None,
        },
    }
}

/// Likely controllers first, then by name
fn sort_ports(ports: &mut [PortInfo]) {
    ports.sort_by(|a, b| {
        b.is_likely_controller()
            .cmp(&a.is_likely_controller())
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Serial ports on this machine; empty if enumeration fails
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = match serialport::available_ports() {
        Ok(found) => found.into_iter().map(port_info).collect(),
        Err(e) => {
            debug!("Port enumeration failed: {}", e);
            Vec::new()
        }
    };
    sort_ports(&mut ports);
    ports
}

/// Open `name` as 8N1 without flow control
///
/// The read timeout is the inter-byte timeout of the frame reader.
pub fn open_port(
    name: &str,
    baud_rate: Option<u32>,
    inter_byte_timeout: Option<Duration>,
) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let mut port = serialport::new(name, baud_rate.unwrap_or(DEFAULT_BAUD_RATE))
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(
            inter_byte_timeout.unwrap_or(Duration::from_millis(DEFAULT_INTER_BYTE_TIMEOUT_MS)),
        )
        .open()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(name.to_string()),
            _ => ProtocolError::SerialError(e.to_string()),
        })?;

    // some boards only talk with DTR asserted; it also triggers their reset
    if let Err(e) = port.write_data_terminal_ready(true) {
        debug!("Could not assert DTR on {}: {}", name, e);
    }
    Ok(port)
}
