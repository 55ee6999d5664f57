use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::Transport;
use crate::error::{AppResult, MonitorError};

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// Serial transport for the USB link to the GPIB controller
///
/// This wraps the serialport crate and provides async I/O using Tokio's
/// blocking task executor for the synchronous serial calls. The link itself
/// forwards bytes unaltered, so [`Transport::escape`] is the identity here;
/// controller-level escaping lives in [`PrologixAdapter`](super::PrologixAdapter).
#[derive(Clone)]
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// Line terminator for commands
    line_terminator: String,

    /// Response line ending character
    response_delimiter: u8,

    /// The actual serial port (behind Arc<Mutex> for async access)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Create a new serial transport with default framing (`\n` both ways)
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600, 115200)
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            line_terminator: "\n".to_string(),
            response_delimiter: b'\n',
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Set the line terminator appended to every command
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Set the byte that ends an instrument reply
    pub fn with_response_delimiter(mut self, delimiter: char) -> Self {
        self.response_delimiter = delimiter as u8;
        self
    }

    /// Port path this transport opens
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Whether the port has been opened
    pub fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    /// Open the serial port
    #[cfg(feature = "instrument_serial")]
    pub fn connect(&mut self) -> AppResult<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(Duration::from_millis(100)) // Internal read timeout
            .open()
            .map_err(|e| {
                MonitorError::Transport(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    self.port_name, self.baud_rate, e
                ))
            })?;

        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(
            "Serial port '{}' opened at {} baud",
            self.port_name, self.baud_rate
        );
        Ok(())
    }

    /// Open the serial port (always fails when serial support is compiled out)
    #[cfg(not(feature = "instrument_serial"))]
    pub fn connect(&mut self) -> AppResult<()> {
        Err(MonitorError::Transport(
            "Serial support not enabled. Rebuild with --features instrument_serial".to_string(),
        ))
    }

    /// Close the serial port
    pub fn disconnect(&mut self) {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> AppResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port.clone().ok_or(MonitorError::NotConnected)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        "serial"
    }

    #[cfg(feature = "instrument_serial")]
    async fn write_raw(&mut self, bytes: &[u8]) -> AppResult<()> {
        let port = self.port()?;
        let frame = bytes.to_vec();

        // Execute blocking serial I/O on dedicated thread
        tokio::task::spawn_blocking(move || -> AppResult<()> {
            use std::io::Write;

            let mut port_guard = port.blocking_lock();
            port_guard.write_all(&frame)?;
            port_guard.flush()?;
            debug!("Sent serial frame: {}", String::from_utf8_lossy(&frame).trim());
            Ok(())
        })
        .await
        .map_err(|e| MonitorError::Transport(format!("Serial I/O task panicked: {}", e)))?
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn write_raw(&mut self, _bytes: &[u8]) -> AppResult<()> {
        Err(MonitorError::NotConnected)
    }

    #[cfg(feature = "instrument_serial")]
    async fn receive(&mut self, timeout: Duration) -> AppResult<String> {
        let port = self.port()?;
        let delimiter = self.response_delimiter;

        tokio::task::spawn_blocking(move || -> AppResult<String> {
            use std::io::Read;

            let mut port_guard = port.blocking_lock();

            // Read byte-by-byte until delimiter
            let mut response = Vec::new();
            let mut buffer = [0u8; 1];
            let start = std::time::Instant::now();

            loop {
                if start.elapsed() > timeout {
                    return Err(MonitorError::timeout("Serial read", timeout));
                }

                match port_guard.read(&mut buffer) {
                    Ok(0) => {
                        // EOF - the USB device went away
                        return Err(MonitorError::Transport(
                            "Unexpected EOF from serial port".to_string(),
                        ));
                    }
                    Ok(_) => {
                        if buffer[0] == delimiter {
                            break;
                        }
                        response.push(buffer[0]);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Port timeout is shorter than our overall timeout
                        continue;
                    }
                    Err(e) => return Err(MonitorError::Io(e)),
                }
            }

            let response = String::from_utf8_lossy(&response).trim().to_string();
            debug!("Received serial response: {}", response);
            Ok(response)
        })
        .await
        .map_err(|e| MonitorError::Transport(format!("Serial I/O task panicked: {}", e)))?
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn receive(&mut self, _timeout: Duration) -> AppResult<String> {
        Err(MonitorError::NotConnected)
    }

    fn escape(&self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }

    fn terminator(&self) -> &[u8] {
        self.line_terminator.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_transport_creation() {
        let transport = SerialTransport::new("/dev/ttyUSB0", 115_200);
        assert_eq!(transport.name(), "serial");
        assert_eq!(transport.port_name(), "/dev/ttyUSB0");
        assert_eq!(transport.baud_rate, 115_200);
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_custom_framing() {
        let transport = SerialTransport::new("COM3", 9600)
            .with_line_terminator("\r\n")
            .with_response_delimiter('\r');
        assert_eq!(transport.terminator(), b"\r\n");
        assert_eq!(transport.response_delimiter, b'\r');
    }

    #[test]
    fn test_raw_link_does_not_escape() {
        let transport = SerialTransport::new("/dev/ttyUSB0", 115_200);
        assert_eq!(transport.escape(b"++addr 20"), b"++addr 20".to_vec());
    }

    #[tokio::test]
    async fn test_send_without_connect_fails() {
        let mut transport = SerialTransport::new("/dev/ttyUSB0", 115_200);
        let err = transport.send("*IDN?").await.unwrap_err();
        assert!(matches!(err, MonitorError::NotConnected));
    }
}
