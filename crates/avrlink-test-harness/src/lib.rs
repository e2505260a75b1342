//! avrlink-test-harness: Test utilities and mock transports for avrlink.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! the line IO engine and receiver backends without real hardware, and
//! [`MockHandle`] for driving the mock after it has been handed to an IO task.

pub mod mock_serial;

pub use mock_serial::{MockHandle, MockTransport};
