//! Marantz status line handling.
//!
//! Lines that answer no pending command reach [`MarantzStatusHandler`]: front
//! panel changes pushed by the receiver, and late replies to commands that
//! already timed out. Every line is forwarded as
//! [`DeviceEvent::Unsolicited`]; lines with a known key additionally produce
//! a typed event.

use tokio::sync::broadcast;
use tracing::debug;

use avrlink_core::events::DeviceEvent;
use avrlink_line_io::protocol::split_line;
use avrlink_line_io::StatusHandler;

use crate::commands;

/// Turns unsolicited Marantz lines into [`DeviceEvent`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarantzStatusHandler;

impl StatusHandler for MarantzStatusHandler {
    fn process(&self, line: &str, event_tx: &broadcast::Sender<DeviceEvent>) {
        let _ = event_tx.send(DeviceEvent::Unsolicited {
            line: line.to_string(),
        });
        let (key, data) = split_line(line);
        process_status(key, data, event_tx);
    }
}

/// Emit the typed event for one status line, if its key is known.
fn process_status(key: &str, data: &str, event_tx: &broadcast::Sender<DeviceEvent>) {
    match key {
        commands::KEY_POWER => match commands::parse_power_response(data) {
            Ok(on) => {
                debug!(on, "status power update");
                let _ = event_tx.send(DeviceEvent::PowerChanged { on });
            }
            Err(e) => {
                debug!(?e, "failed to parse power status");
            }
        },
        commands::KEY_MUTE => match commands::parse_mute_response(data) {
            Ok(muted) => {
                debug!(muted, "status mute update");
                let _ = event_tx.send(DeviceEvent::MuteChanged { muted });
            }
            Err(e) => {
                debug!(?e, "failed to parse mute status");
            }
        },
        commands::KEY_VOLUME => match commands::parse_volume_response(data) {
            Ok(db_tenths) => {
                debug!(db_tenths, "status volume update");
                let _ = event_tx.send(DeviceEvent::VolumeChanged { db_tenths });
            }
            Err(e) => {
                debug!(?e, "failed to parse volume status");
            }
        },
        commands::KEY_SOURCE => match commands::parse_source_response(data) {
            Ok(source) => {
                debug!(source, "status source update");
                let _ = event_tx.send(DeviceEvent::SourceChanged { source });
            }
            Err(e) => {
                debug!(?e, "failed to parse source status");
            }
        },
        _ => {
            debug!(key, data, "unhandled status line");
        }
    }
}
