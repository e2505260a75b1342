//! Core types shared by the avrlink crates.
//!
//! These describe the state and policies of a single device connection,
//! independent of which receiver family is on the other end of the line.

use std::fmt;
use std::str::FromStr;

/// Lifecycle state of the link to a device.
///
/// Transitions are driven only by the IO task. Commands are written to
/// the transport only while the state is [`Open`](ConnectionState::Open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// The transport is closed. This is the initial state.
    #[default]
    Closed,
    /// An open request is in progress.
    Opening,
    /// The transport is open and commands may be written.
    Open,
    /// The transport is being closed.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Opening => "opening",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        write!(f, "{s}")
    }
}

/// When the transport is opened and closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionPolicy {
    /// Open for each command, close once its response (or timeout) is in.
    ///
    /// Suits devices that misbehave when the port is left open while idle.
    #[default]
    PerCommand,
    /// Open once, keep the port open, and reconnect after a drop.
    Persistent,
}

impl fmt::Display for ConnectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionPolicy::PerCommand => "per-command",
            ConnectionPolicy::Persistent => "persistent",
        };
        write!(f, "{s}")
    }
}

/// Error returned when a string cannot be parsed into a [`ConnectionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseConnectionPolicyError(String);

impl fmt::Display for ParseConnectionPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown connection policy: {}", self.0)
    }
}

impl std::error::Error for ParseConnectionPolicyError {}

impl FromStr for ConnectionPolicy {
    type Err = ParseConnectionPolicyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "per-command" | "percommand" | "per_command" => Ok(ConnectionPolicy::PerCommand),
            "persistent" => Ok(ConnectionPolicy::Persistent),
            _ => Err(ParseConnectionPolicyError(s.to_string())),
        }
    }
}

/// What happens to waiting callers when the command queue overflows.
///
/// On overflow the whole queue and every pending response are discarded
/// before the new command is appended. This enum only decides whether the
/// discarded callers hear about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OverflowPolicy {
    /// Discarded continuations are dropped without a value.
    #[default]
    Silent,
    /// Each discarded continuation receives [`Error::Dropped`](crate::Error::Dropped).
    Notify,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverflowPolicy::Silent => "silent",
            OverflowPolicy::Notify => "notify",
        };
        write!(f, "{s}")
    }
}

/// Error returned when a string cannot be parsed into an [`OverflowPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOverflowPolicyError(String);

impl fmt::Display for ParseOverflowPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown overflow policy: {}", self.0)
    }
}

impl std::error::Error for ParseOverflowPolicyError {}

impl FromStr for OverflowPolicy {
    type Err = ParseOverflowPolicyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "silent" => Ok(OverflowPolicy::Silent),
            "notify" => Ok(OverflowPolicy::Notify),
            _ => Err(ParseOverflowPolicyError(s.to_string())),
        }
    }
}
