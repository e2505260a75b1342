//! Marantz RS-232C backend for avrlink.
//!
//! This crate implements the `@KEY:ARG` serial protocol spoken by Marantz AV
//! receivers on top of the queued line engine in `avrlink-line-io`. It
//! provides:
//!
//! - **Command builders** ([`commands`]) -- construct command bodies for
//!   power, mute, volume, source and test tone, and parse the replies.
//! - **Status handling** ([`status`]) -- turn lines pushed by the receiver
//!   into typed [`DeviceEvent`](avrlink_core::DeviceEvent)s.
//! - **Configuration** ([`config`]) -- the JSON device block a host stores
//!   for each receiver.
//! - **Receiver driver** ([`receiver`]) -- high-level async operations with
//!   event emission.
//! - **Builder** ([`builder`]) -- fluent builder API for constructing
//!   [`MarantzReceiver`] instances.
//!
//! # Example
//!
//! ```
//! use avrlink_marantz::commands::{cmd_set_volume, parse_volume_response, response_arg, KEY_VOLUME};
//!
//! // Build a "set volume to -35.0 dB" command
//! let cmd = cmd_set_volume(-350).unwrap();
//! assert_eq!(cmd, "@VOL:0-350\r");
//!
//! // Parse the receiver's reply
//! let arg = response_arg("@VOL:-350", KEY_VOLUME).unwrap();
//! assert_eq!(parse_volume_response(arg).unwrap(), -350);
//! ```

pub mod builder;
pub mod commands;
pub mod config;
pub mod receiver;
pub mod status;

// Re-export the primary types for ergonomic `use avrlink_marantz::*`.
pub use builder::MarantzBuilder;
pub use commands::VolumeStep;
pub use config::DeviceConfig;
pub use receiver::MarantzReceiver;
pub use status::MarantzStatusHandler;
