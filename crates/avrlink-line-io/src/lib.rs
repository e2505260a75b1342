//! Queued, correlated request/response engine for line-protocol devices.
//!
//! This crate provides the single-IO-task pattern for devices that speak
//! carriage-return terminated ASCII over a half-duplex link with no
//! correlation identifiers. One tokio task owns the transport exclusively and
//! handles queueing, inter-command spacing, reply correlation by key,
//! timeouts, the connection lifecycle, and unsolicited status lines.
//!
//! # Architecture
//!
//! - [`protocol`] -- command encoding, key extraction, line framing
//! - [`queue`] -- bounded FIFO of commands not yet written
//! - [`correlator`] -- pending responses keyed by correlation key
//! - [`io`] -- IO task types, spawn, and the select loop

pub mod correlator;
pub mod io;
pub mod protocol;
pub mod queue;

pub use io::{spawn_io_task, DeviceIo, IoConfig, IoSnapshot, RawStatusHandler, StatusHandler};
pub use queue::Reply;
