use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};

use super::{Result, SerialError};
use crate::config::EngineConfig;

pub const BAUD_RATE: u32 = 57600;

// Guards against a gateway that streams bytes without ever sending a newline.
const MAX_PENDING_BYTES: usize = 4096;

/// Line-oriented access to the radio gateway.
///
/// Implementations are not thread-safe on their own; the engine serializes
/// every call through a single gate.
pub trait LineTransport: Send {
    /// Open the underlying handle. Opening an open transport reopens it.
    fn open(&mut self) -> Result<()>;

    /// Release the handle. Closing a closed transport is a no-op.
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Read one newline-terminated line, without the line ending.
    ///
    /// `Ok(None)` means the read timeout elapsed before a full line arrived.
    fn read_line(&mut self) -> Result<Option<String>>;

    /// Write the exact bytes of an encoded command.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Discard pending input and output, where the transport supports it.
    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct SerialInterface {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
    pending: Vec<u8>,
}

impl SerialInterface {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: BAUD_RATE,
            timeout: Duration::from_secs(2),
            port: None,
            pending: Vec::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            timeout: config.read_timeout(),
            ..Self::new(config.port.clone())
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn take_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=newline).collect();
        let line = String::from_utf8_lossy(&raw);
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

impl LineTransport for SerialInterface {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            log::warn!("Serial port {} already open, closing first", self.port_name);
            self.close()?;
        }

        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => {
                    SerialError::PortNotFound(self.port_name.clone())
                }
                _ => SerialError::ConnectionFailed(format!("{}: {}", self.port_name, e)),
            })?;

        self.port = Some(port);
        self.pending.clear();
        log::info!("Opened serial port {} at {} baud", self.port_name, self.baud_rate);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.port.take() {
            Some(_) => log::info!("Serial port {} closed", self.port_name),
            None => log::debug!("Serial port {} already closed", self.port_name),
        }
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout)?;
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        if self.port.is_none() {
            return Err(SerialError::NotOpen);
        }
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 256];
        loop {
            let port = self.port.as_mut().ok_or(SerialError::NotOpen)?;
            match port.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    if let Some(line) = self.take_line() {
                        return Ok(Some(line));
                    }
                    if self.pending.len() > MAX_PENDING_BYTES {
                        log::warn!("Discarding {} bytes without line ending", self.pending.len());
                        self.pending.clear();
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(SerialError::IoError(e)),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(SerialError::NotOpen)?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let port = self.port.as_mut().ok_or(SerialError::NotOpen)?;
        port.clear(ClearBuffer::All)?;
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_line_strips_line_endings() {
        let mut interface = SerialInterface::new("/dev/null");
        interface.pending.extend_from_slice(b"OK 24 1 4 9 88 163 1 0 10 0 20\r\nOK 2");
        assert_eq!(
            interface.take_line().as_deref(),
            Some("OK 24 1 4 9 88 163 1 0 10 0 20")
        );
        assert_eq!(interface.take_line(), None);
        assert_eq!(interface.pending, b"OK 2");
    }

    #[test]
    fn test_closed_interface_rejects_io() {
        let mut interface = SerialInterface::new("/dev/null");
        assert!(!interface.is_open());
        assert!(matches!(interface.read_line(), Err(SerialError::NotOpen)));
        assert!(matches!(interface.write_all(b"1,4s"), Err(SerialError::NotOpen)));
        assert!(interface.close().is_ok());
        assert!(interface.close().is_ok());
    }

    #[test]
    fn test_from_config_uses_configured_port() {
        let config = EngineConfig::default().with_port("/dev/ttyACM3");
        let interface = SerialInterface::from_config(&config);
        assert_eq!(interface.port_name(), "/dev/ttyACM3");
        assert_eq!(interface.baud_rate, BAUD_RATE);
    }
}
