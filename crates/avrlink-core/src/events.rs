//! Asynchronous device event types.
//!
//! Events are emitted by the IO task through a `tokio::sync::broadcast`
//! channel: connection lifecycle changes, every unsolicited line the device
//! pushes, and typed status changes decoded from those lines by a status
//! handler.

/// An event emitted when the device or its connection changes state.
///
/// Events are delivered on a best-effort basis through a bounded broadcast
/// channel; slow consumers may miss events under heavy load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The transport was opened.
    Connected,

    /// The transport was closed.
    Disconnected {
        /// Why the link went down. `None` for an orderly close.
        reason: Option<String>,
    },

    /// A reconnect attempt is about to be made after a drop.
    Reconnecting {
        /// The reconnection attempt number (1-based).
        attempt: u32,
    },

    /// A line arrived that answers no pending command.
    ///
    /// Device-initiated status pushes and late replies to timed-out
    /// commands both end up here.
    Unsolicited {
        /// The line, without its terminator.
        line: String,
    },

    /// Main power state changed.
    PowerChanged {
        /// `true` if the device is on.
        on: bool,
    },

    /// Audio mute state changed.
    MuteChanged {
        /// `true` if muted.
        muted: bool,
    },

    /// Master volume changed.
    VolumeChanged {
        /// Volume in tenths of a decibel (e.g. `-350` is -35.0 dB).
        db_tenths: i16,
    },

    /// Selected input source changed.
    SourceChanged {
        /// Source index (0-23).
        source: u8,
    },
}
