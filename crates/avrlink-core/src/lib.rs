//! avrlink-core: Core traits, types, and error definitions for avrlink.
//!
//! This crate defines the device-agnostic abstractions shared by the
//! transport, the line IO engine and the receiver backends. Host
//! applications depend on these types without pulling in a specific
//! receiver family.
//!
//! # Key types
//!
//! - [`Transport`] -- reopenable byte-level communication channel
//! - [`DeviceEvent`] -- asynchronous lifecycle and status notifications
//! - [`ConnectionState`], [`ConnectionPolicy`], [`OverflowPolicy`]
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use events::DeviceEvent;
pub use transport::Transport;
pub use types::*;
