pub mod interface;
pub mod protocol;
pub mod scripted;

pub use interface::{LineTransport, SerialInterface, BAUD_RATE};
pub use protocol::{Channel, Command, DeviceId, Frame, ProtocolError, Telemetry};
pub use scripted::ScriptedTransport;

use serde::{Deserialize, Serialize};
use serialport::SerialPortType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Serial port is not open")]
    NotOpen,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// List serial ports a USB radio gateway can sit behind.
///
/// Matches `ttyUSB*`/`ttyACM*` device names as well as any port the OS
/// reports as USB-attached.
pub fn list_serial_ports() -> Result<Vec<SerialDeviceInfo>> {
    let ports = serialport::available_ports()?;
    let mut devices = Vec::new();

    for port in ports {
        let looks_like_gateway =
            port.port_name.contains("ttyUSB") || port.port_name.contains("ttyACM");

        match port.port_type {
            SerialPortType::UsbPort(usb_info) => devices.push(SerialDeviceInfo {
                port_name: port.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                serial_number: usb_info.serial_number,
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            }),
            _ if looks_like_gateway => devices.push(SerialDeviceInfo {
                port_name: port.port_name,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            }),
            _ => {}
        }
    }

    devices.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    Ok(devices)
}
