//! MarantzBuilder -- fluent builder for constructing [`MarantzReceiver`] instances.
//!
//! Separates configuration from construction so that callers can set up
//! serial port parameters, queueing and timeout values, and the connection
//! policy before the IO task is started.
//!
//! # Example
//!
//! ```no_run
//! use avrlink_marantz::builder::MarantzBuilder;
//! use avrlink_core::types::ConnectionPolicy;
//! use std::time::Duration;
//!
//! # async fn example() -> avrlink_core::Result<()> {
//! let receiver = MarantzBuilder::new()
//!     .name("Living Room")
//!     .serial_port("/dev/ttyUSB0")
//!     .timeout(Duration::from_millis(1500))
//!     .connection_policy(ConnectionPolicy::Persistent)
//!     .build()
//!     .await?;
//! println!("power: {}", receiver.power().await?);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tokio::sync::broadcast;

use avrlink_core::error::{Error, Result};
use avrlink_core::transport::Transport;
use avrlink_core::types::{ConnectionPolicy, OverflowPolicy};
use avrlink_line_io::{spawn_io_task, IoConfig};
use avrlink_transport::{SerialConfig, SerialTransport};

use crate::commands::MAX_VOLUME_MAGNITUDE;
use crate::config::DeviceConfig;
use crate::receiver::MarantzReceiver;
use crate::status::MarantzStatusHandler;

/// Default serial speed of the receiver's RS-232C port.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Fluent builder for [`MarantzReceiver`].
///
/// All configuration has working defaults, so the simplest usage is:
///
/// ```ignore
/// let receiver = MarantzBuilder::new()
///     .serial_port("/dev/ttyUSB0")
///     .build()
///     .await?;
/// ```
pub struct MarantzBuilder {
    name: String,
    serial_port: Option<String>,
    baud_rate: u32,
    io_config: IoConfig,
    volume_limits: Option<(i16, i16)>,
}

impl Default for MarantzBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MarantzBuilder {
    pub fn new() -> Self {
        MarantzBuilder {
            name: "Marantz".to_string(),
            serial_port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            io_config: IoConfig::default(),
            volume_limits: None,
        }
    }

    /// Start from a host device configuration.
    ///
    /// Fails when the configuration names an unknown connection or overflow
    /// policy.
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let mut builder = MarantzBuilder::new()
            .name(&config.name)
            .serial_port(&config.path)
            .baud_rate(config.baud_rate)
            .timeout(config.timeout())
            .inter_command_delay(config.inter_command_delay())
            .queue_capacity(config.queue_capacity)
            .connection_policy(config.connection_policy()?)
            .overflow_policy(config.overflow_policy()?)
            .reconnect_delay(config.reconnect_delay())
            .max_reconnect_attempts(config.max_reconnect_attempts);
        if let Some((min, max)) = config.volume_limits() {
            builder = builder.volume_limits(min, max);
        }
        Ok(builder)
    }

    /// Display name used in logs.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the serial port path (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the default baud rate (9600).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    /// How long a command waits for its reply (default: 1s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.io_config.timeout = timeout;
        self
    }

    /// Minimum spacing between two writes (default: 1s).
    pub fn inter_command_delay(mut self, delay: Duration) -> Self {
        self.io_config.inter_command_delay = delay;
        self
    }

    /// Queue length beyond which all queued and pending work is discarded
    /// (default: 50).
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.io_config.queue_capacity = capacity;
        self
    }

    /// Open per command (default) or keep the port open.
    pub fn connection_policy(mut self, policy: ConnectionPolicy) -> Self {
        self.io_config.policy = policy;
        self
    }

    /// Whether callers discarded by a queue overflow are told about it.
    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.io_config.overflow = policy;
        self
    }

    /// Wait between reconnect attempts in persistent mode (default: 1s).
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.io_config.reconnect_delay = delay;
        self
    }

    /// Reconnect attempts before giving up in persistent mode. `0` retries
    /// forever (default: 5).
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.io_config.max_reconnect_attempts = attempts;
        self
    }

    /// Clamp volume writes to `min..=max` tenths of a dB.
    pub fn volume_limits(mut self, min: i16, max: i16) -> Self {
        self.volume_limits = Some((min, max));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.io_config.timeout.is_zero() {
            return Err(Error::InvalidParameter("timeout must be non-zero".into()));
        }
        if self.io_config.queue_capacity == 0 {
            return Err(Error::InvalidParameter(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if let Some((min, max)) = self.volume_limits {
            if min > max {
                return Err(Error::InvalidParameter(format!(
                    "volume limits are inverted: {min} > {max}"
                )));
            }
            if min < -MAX_VOLUME_MAGNITUDE || max > MAX_VOLUME_MAGNITUDE {
                return Err(Error::InvalidParameter(format!(
                    "volume limits must lie within ±{MAX_VOLUME_MAGNITUDE}"
                )));
            }
        }
        Ok(())
    }

    /// Build a [`MarantzReceiver`] with a caller-provided transport.
    ///
    /// This is the primary entry point for testing (pass a `MockTransport`
    /// from `avrlink-test-harness`). The transport may be closed; the IO task
    /// opens it according to the connection policy.
    pub async fn build_with_transport(
        self,
        transport: Box<dyn Transport>,
    ) -> Result<MarantzReceiver> {
        self.validate()?;

        let (event_tx, _) = broadcast::channel(256);
        let io = spawn_io_task(
            transport,
            self.io_config,
            event_tx,
            Box::new(MarantzStatusHandler),
        );
        Ok(MarantzReceiver::new(self.name, io, self.volume_limits))
    }

    /// Build a [`MarantzReceiver`] using a serial transport.
    ///
    /// Requires that [`serial_port()`](Self::serial_port) has been called.
    /// The port is not opened here.
    pub async fn build(self) -> Result<MarantzReceiver> {
        let port = self
            .serial_port
            .clone()
            .ok_or_else(|| Error::InvalidParameter("serial_port is required for build()".into()))?;
        let transport = SerialTransport::new(port, SerialConfig::with_baud_rate(self.baud_rate));
        self.build_with_transport(Box::new(transport)).await
    }
}
