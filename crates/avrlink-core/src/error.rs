//! Error types for avrlink.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-level failures (open, write,
//! disconnect), acknowledgement timeouts and queue-overflow drops are all
//! captured here.

/// The error type for all avrlink operations.
///
/// Only transport-level failures affect more than the one command that
/// caused them: they also flush every other pending response with
/// [`Error::ConnectionLost`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport could not be opened (port missing, busy, or denied).
    ///
    /// Fatal for the command that triggered the open; later commands retry.
    #[error("failed to open transport: {0}")]
    Open(String),

    /// Writing a command to the transport failed.
    #[error("write failed: {0}")]
    Write(String),

    /// No matching response arrived before the command's deadline.
    #[error("timeout waiting for acknowledgement")]
    Timeout,

    /// The command was discarded by a queue-overflow clear.
    ///
    /// Only delivered when the overflow policy asks for notification; the
    /// convenience helpers also report a continuation that was dropped
    /// without a value this way.
    #[error("command dropped by queue overflow")]
    Dropped,

    /// The connection to the device was lost while the command was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// No connection to the device is available.
    #[error("not connected")]
    NotConnected,

    /// A response could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An invalid parameter was passed to a command builder or config.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
