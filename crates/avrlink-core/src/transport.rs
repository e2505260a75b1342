//! Transport trait for device communication.
//!
//! The [`Transport`] trait abstracts over the physical link to a receiver.
//! Implementations exist for serial ports (`avrlink-transport`) and a mock
//! transport for testing (`avrlink-test-harness`).
//!
//! The IO task in `avrlink-line-io` operates on a `Transport` rather than
//! directly on a serial port, which is what makes the queue, correlator and
//! reconnect logic testable without hardware.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous, reopenable byte-level transport to a device.
///
/// A transport starts closed. The IO task decides when to call
/// [`open`](Transport::open) and [`close`](Transport::close); line framing
/// happens above this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying link.
    ///
    /// Calling `open()` on an already open transport must succeed without
    /// reopening. Failures are reported as
    /// [`Error::Open`](crate::error::Error::Open).
    async fn open(&mut self) -> Result<()>;

    /// Send raw bytes to the device.
    ///
    /// Implementations should wait until all bytes have been handed to the
    /// underlying link. Returns [`Error::NotConnected`](crate::error::Error::NotConnected)
    /// when the transport is closed.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the device into the provided buffer.
    ///
    /// Returns the number of bytes read. Waits up to `timeout` for data;
    /// returns [`Error::Timeout`](crate::error::Error::Timeout) if nothing
    /// arrived and [`Error::ConnectionLost`](crate::error::Error::ConnectionLost)
    /// if the link dropped. Must be cancel safe: dropping the future before
    /// it completes must not lose bytes.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the link. The transport may be reopened afterwards.
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently open.
    fn is_connected(&self) -> bool;
}
