//! JSON device configuration.
//!
//! Mirrors the accessory block a home-automation host stores for a receiver:
//!
//! ```json
//! {
//!     "name": "Living Room",
//!     "path": "/dev/ttyUSB0",
//!     "timeout": 1000,
//!     "minVolume": -70,
//!     "maxVolume": 10
//! }
//! ```
//!
//! Unknown keys are ignored, so a full host accessory entry can be passed in
//! unchanged. Durations are in milliseconds, volume limits in decibels.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use avrlink_core::error::{Error, Result};
use avrlink_core::types::{ConnectionPolicy, OverflowPolicy};

use crate::commands::MAX_VOLUME_MAGNITUDE;

fn default_name() -> String {
    "Marantz".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    50
}

fn default_connection_policy() -> String {
    ConnectionPolicy::default().to_string()
}

fn default_overflow_policy() -> String {
    OverflowPolicy::default().to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

/// One receiver as described by the host configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Reply timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    /// Spacing between writes in milliseconds. Defaults to `timeout`.
    #[serde(default)]
    pub inter_command_delay: Option<u64>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// `per-command` or `persistent`.
    #[serde(default = "default_connection_policy")]
    pub connection_policy: String,
    /// `silent` or `notify`.
    #[serde(default = "default_overflow_policy")]
    pub overflow_policy: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Upper volume limit in dB.
    #[serde(default)]
    pub max_volume: Option<f32>,
    /// Lower volume limit in dB.
    #[serde(default)]
    pub min_volume: Option<f32>,
}

impl DeviceConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidParameter(format!("invalid device config: {e}")))
    }

    /// Read and parse a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay.unwrap_or(self.timeout))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay)
    }

    pub fn connection_policy(&self) -> Result<ConnectionPolicy> {
        self.connection_policy
            .parse()
            .map_err(|e| Error::InvalidParameter(format!("{e}")))
    }

    pub fn overflow_policy(&self) -> Result<OverflowPolicy> {
        self.overflow_policy
            .parse()
            .map_err(|e| Error::InvalidParameter(format!("{e}")))
    }

    /// Volume limits in tenths of a dB, or `None` when neither is set.
    ///
    /// A missing bound falls back to the end of the wire range.
    pub fn volume_limits(&self) -> Option<(i16, i16)> {
        if self.min_volume.is_none() && self.max_volume.is_none() {
            return None;
        }
        let to_tenths = |db: f32| {
            let tenths = (db * 10.0).round();
            tenths.clamp(-(MAX_VOLUME_MAGNITUDE as f32), MAX_VOLUME_MAGNITUDE as f32) as i16
        };
        let min = self.min_volume.map_or(-MAX_VOLUME_MAGNITUDE, to_tenths);
        let max = self.max_volume.map_or(MAX_VOLUME_MAGNITUDE, to_tenths);
        Some((min, max))
    }
}
