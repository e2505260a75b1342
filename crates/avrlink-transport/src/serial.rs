//! Serial port transport for receiver communication.
//!
//! This module provides [`SerialTransport`], which implements the [`Transport`]
//! trait for RS-232 ports and USB-to-serial adapters.
//!
//! Marantz receivers with an RS-232C control port speak 9600 baud, 8 data
//! bits, no parity, 1 stop bit, without flow control. That is the default
//! [`SerialConfig`].

use async_trait::async_trait;
use avrlink_core::error::{Error, Result};
use avrlink_core::transport::Transport;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Serial port configuration.
///
/// Defaults match the receiver control port:
/// - 9600 baud
/// - 8 data bits
/// - 1 stop bit
/// - No parity
/// - No flow control
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Baud rate (e.g., 9600, 19200, 38400)
    pub baud_rate: u32,
    /// Number of data bits (typically 8)
    pub data_bits: DataBits,
    /// Number of stop bits (typically 1)
    pub stop_bits: StopBits,
    /// Parity checking (typically None)
    pub parity: Parity,
    /// Flow control (typically None)
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Default settings with a different baud rate.
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Reopenable serial port transport.
///
/// Holds the port path and settings; the OS handle exists only between
/// [`Transport::open`] and [`Transport::close`].
pub struct SerialTransport {
    port: Option<SerialStream>,
    port_name: String,
    config: SerialConfig,
}

impl SerialTransport {
    /// Create a closed transport for the given port.
    ///
    /// # Arguments
    ///
    /// * `port` - Serial port path (e.g., "/dev/ttyUSB0" on Linux, "COM3" on Windows)
    /// * `config` - Line settings used every time the port is opened
    pub fn new(port: impl Into<String>, config: SerialConfig) -> Self {
        Self {
            port: None,
            port_name: port.into(),
            config,
        }
    }

    /// Get the name of the serial port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Get the line settings.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        tracing::debug!(
            port = %self.port_name,
            baud_rate = self.config.baud_rate,
            data_bits = ?self.config.data_bits,
            stop_bits = ?self.config.stop_bits,
            parity = ?self.config.parity,
            flow_control = ?self.config.flow_control,
            "Opening serial port"
        );

        let stream = tokio_serial::new(&self.port_name, self.config.baud_rate)
            .data_bits(self.config.data_bits.into())
            .stop_bits(self.config.stop_bits.into())
            .parity(self.config.parity.into())
            .flow_control(self.config.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %self.port_name, error = %e, "Failed to open serial port");
                Error::Open(format!("{}: {}", self.port_name, e))
            })?;

        tracing::info!(
            port = %self.port_name,
            baud_rate = self.config.baud_rate,
            "Serial port opened"
        );

        self.port = Some(stream);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(
            port = %self.port_name,
            bytes = data.len(),
            data = %String::from_utf8_lossy(data).escape_debug(),
            "Sending data"
        );

        port.write_all(data).await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to send data");
            map_io_error(e)
        })?;

        port.flush().await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to flush serial port");
            map_io_error(e)
        })?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(0)) => {
                tracing::warn!(port = %self.port_name, "Serial port reported end of stream");
                Err(Error::ConnectionLost)
            }
            Ok(Ok(n)) => {
                tracing::trace!(
                    port = %self.port_name,
                    bytes = n,
                    data = %String::from_utf8_lossy(&buf[..n]).escape_debug(),
                    "Received data"
                );
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(port = %self.port_name, error = %e, "Failed to receive data");
                Err(map_io_error(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            tracing::debug!(port = %self.port_name, "Closing serial port");

            if let Err(e) = port.flush().await {
                tracing::warn!(
                    port = %self.port_name,
                    error = %e,
                    "Failed to flush before closing (continuing anyway)"
                );
            }

            tracing::info!(port = %self.port_name, "Serial port closed");
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.port.is_some() {
            tracing::debug!(port = %self.port_name, "SerialTransport dropped, closing port");
        }
    }
}
