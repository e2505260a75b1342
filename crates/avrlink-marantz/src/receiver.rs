//! MarantzReceiver -- high-level control of a Marantz AV receiver.
//!
//! This module ties the command builders and parsers in [`commands`] to the
//! line IO engine. Every operation is queued through [`DeviceIo`], so calls
//! from several tasks are serialized and spaced on the wire, and each reply
//! is matched to its command by key.
//!
//! Successful reads and writes are echoed as typed [`DeviceEvent`]s so that
//! subscribers see the same stream whether a change was requested here or
//! pushed by the receiver.

use tokio::sync::broadcast;
use tracing::debug;

use avrlink_core::error::Result;
use avrlink_core::events::DeviceEvent;
use avrlink_core::transport::Transport;
use avrlink_line_io::{DeviceIo, IoSnapshot};

use crate::commands::{self, VolumeStep};

/// A Marantz receiver controlled over RS-232.
///
/// Constructed via [`MarantzBuilder`](crate::builder::MarantzBuilder).
pub struct MarantzReceiver {
    name: String,
    io: DeviceIo,
    /// Allowed volume range in tenths of a dB.
    volume_limits: Option<(i16, i16)>,
}

impl MarantzReceiver {
    pub(crate) fn new(name: String, io: DeviceIo, volume_limits: Option<(i16, i16)>) -> Self {
        MarantzReceiver {
            name,
            io,
            volume_limits,
        }
    }

    /// Display name of this receiver.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured volume range in tenths of a dB, if any.
    pub fn volume_limits(&self) -> Option<(i16, i16)> {
        self.volume_limits
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.io.event_tx.send(event);
    }

    async fn query(&self, body: String, key: &str) -> Result<String> {
        let line = self.io.command(body).await?;
        Ok(commands::response_arg(&line, key)?.to_string())
    }

    // ---------------------------------------------------------------
    // Power
    // ---------------------------------------------------------------

    /// Read the main power state. `true` = on.
    pub async fn power(&self) -> Result<bool> {
        debug!(receiver = %self.name, "reading power state");
        let data = self.query(commands::cmd_read_power(), commands::KEY_POWER).await?;
        let on = commands::parse_power_response(&data)?;
        self.emit(DeviceEvent::PowerChanged { on });
        Ok(on)
    }

    /// Switch the receiver on or to standby.
    pub async fn set_power(&self, on: bool) -> Result<()> {
        debug!(receiver = %self.name, on, "setting power");
        self.io.command(commands::cmd_set_power(on)).await?;
        self.emit(DeviceEvent::PowerChanged { on });
        Ok(())
    }

    // ---------------------------------------------------------------
    // Mute
    // ---------------------------------------------------------------

    /// Read the audio mute state. `true` = muted.
    pub async fn mute(&self) -> Result<bool> {
        debug!(receiver = %self.name, "reading mute state");
        let data = self.query(commands::cmd_read_mute(), commands::KEY_MUTE).await?;
        let muted = commands::parse_mute_response(&data)?;
        self.emit(DeviceEvent::MuteChanged { muted });
        Ok(muted)
    }

    pub async fn set_mute(&self, muted: bool) -> Result<()> {
        debug!(receiver = %self.name, muted, "setting mute");
        self.io.command(commands::cmd_set_mute(muted)).await?;
        self.emit(DeviceEvent::MuteChanged { muted });
        Ok(())
    }

    // ---------------------------------------------------------------
    // Volume
    // ---------------------------------------------------------------

    /// Read the master volume in tenths of a dB.
    pub async fn volume(&self) -> Result<i16> {
        debug!(receiver = %self.name, "reading volume");
        let data = self
            .query(commands::cmd_read_volume(), commands::KEY_VOLUME)
            .await?;
        let db_tenths = commands::parse_volume_response(&data)?;
        self.emit(DeviceEvent::VolumeChanged { db_tenths });
        Ok(db_tenths)
    }

    /// Set the master volume in tenths of a dB.
    ///
    /// The value is clamped to the configured volume limits. Returns the
    /// value actually sent.
    pub async fn set_volume(&self, db_tenths: i16) -> Result<i16> {
        let target = match self.volume_limits {
            Some((min, max)) => db_tenths.clamp(min, max),
            None => db_tenths,
        };
        if target != db_tenths {
            debug!(requested = db_tenths, target, "volume clamped to limits");
        }
        let cmd = commands::cmd_set_volume(target)?;
        debug!(receiver = %self.name, db_tenths = target, "setting volume");
        self.io.command(cmd).await?;
        self.emit(DeviceEvent::VolumeChanged { db_tenths: target });
        Ok(target)
    }

    /// Step the volume up or down.
    ///
    /// Returns the new volume when the receiver reports it in its reply.
    pub async fn step_volume(&self, step: VolumeStep) -> Result<Option<i16>> {
        debug!(receiver = %self.name, ?step, "stepping volume");
        let data = self
            .query(commands::cmd_step_volume(step), commands::KEY_VOLUME)
            .await?;
        match commands::parse_volume_response(&data) {
            Ok(db_tenths) => {
                self.emit(DeviceEvent::VolumeChanged { db_tenths });
                Ok(Some(db_tenths))
            }
            Err(e) => {
                debug!(?e, "volume step reply carried no level");
                Ok(None)
            }
        }
    }

    // ---------------------------------------------------------------
    // Source
    // ---------------------------------------------------------------

    /// Read the selected input source (0-23).
    pub async fn source(&self) -> Result<u8> {
        debug!(receiver = %self.name, "reading source");
        let data = self
            .query(commands::cmd_read_source(), commands::KEY_SOURCE)
            .await?;
        let source = commands::parse_source_response(&data)?;
        self.emit(DeviceEvent::SourceChanged { source });
        Ok(source)
    }

    /// Select an input source (0-23).
    pub async fn set_source(&self, source: u8) -> Result<()> {
        let cmd = commands::cmd_set_source(source)?;
        debug!(receiver = %self.name, source, "setting source");
        self.io.command(cmd).await?;
        self.emit(DeviceEvent::SourceChanged { source });
        Ok(())
    }

    // ---------------------------------------------------------------
    // Test tone and identify
    // ---------------------------------------------------------------

    /// Toggle the test tone.
    ///
    /// The tone command gets no reply of its own; a volume query queued right
    /// behind it confirms the receiver is still answering.
    pub async fn toggle_test_tone(&self) -> Result<()> {
        debug!(receiver = %self.name, "toggling test tone");
        self.io.send(commands::cmd_toggle_test_tone())?;
        self.volume().await?;
        Ok(())
    }

    /// Make the receiver audibly identify itself: power on, then a short
    /// test tone burst.
    pub async fn identify(&self) -> Result<()> {
        debug!(receiver = %self.name, "identify");
        self.set_power(true).await?;
        self.toggle_test_tone().await?;
        self.toggle_test_tone().await
    }

    // ---------------------------------------------------------------
    // Raw access and lifecycle
    // ---------------------------------------------------------------

    /// Send an arbitrary command body and wait for the reply line.
    ///
    /// A missing carriage return is added.
    pub async fn raw_command(&self, body: &str) -> Result<String> {
        debug!(receiver = %self.name, body, "raw command");
        self.io
            .command(avrlink_line_io::protocol::frame(body))
            .await
    }

    /// Open the port now rather than on the first command.
    pub async fn connect(&self) -> Result<()> {
        self.io.connect().await
    }

    /// Subscribe to connection and status events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.io.subscribe()
    }

    /// Current connection, queue and pending-response state.
    pub async fn snapshot(&self) -> Result<IoSnapshot> {
        self.io.snapshot().await
    }

    /// Stop the IO task, failing anything still queued, and hand back the
    /// closed transport.
    pub async fn shutdown(self) -> Result<Box<dyn Transport>> {
        debug!(receiver = %self.name, "shutting down");
        self.io.shutdown().await
    }
}
