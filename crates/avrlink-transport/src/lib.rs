//! Transport implementations for avrlink.
//!
//! This crate provides the serial implementation of the
//! [`Transport`](avrlink_core::Transport) trait from `avrlink-core`:
//!
//! - [`SerialTransport`]: USB-to-serial adapters and RS-232 ports
//!
//! A [`SerialTransport`] is created closed. The IO task in
//! `avrlink-line-io` opens and closes it according to the connection
//! policy, so the same value is reused across many open/close cycles.
//!
//! # Example
//!
//! ```no_run
//! use avrlink_transport::{SerialConfig, SerialTransport};
//! use avrlink_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> avrlink_core::Result<()> {
//! let mut transport = SerialTransport::new("/dev/ttyUSB0", SerialConfig::default());
//! transport.open().await?;
//!
//! transport.send(b"@PWR:?\r").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # let _ = n;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod serial;

pub use serial::{DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits};
