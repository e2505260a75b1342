//! Marantz RS-232C command builders and response parsers.
//!
//! This module provides functions to construct command bodies for the
//! receiver operations (power, mute, volume, source, test tone) and to parse
//! the corresponding responses.
//!
//! All functions are pure -- they produce or consume strings without
//! performing any I/O. Builders return the full wire body including the
//! carriage return; parsers take the argument part of a response (everything
//! after `@KEY:`), as split off by [`response_arg`].
//!
//! # Marantz command reference
//!
//! Every command is `@KEY:ARG\r` and the receiver answers with the same key.
//! On/off arguments are `2` for on and `1` for off. Volume is in tenths of a
//! decibel with an explicit sign.

use avrlink_core::{Error, Result};
use avrlink_line_io::protocol::{encode_command, split_line};

// ---------------------------------------------------------------
// Keys
// ---------------------------------------------------------------

/// Main power.
pub const KEY_POWER: &str = "@PWR";
/// Audio mute.
pub const KEY_MUTE: &str = "@AMT";
/// Master volume.
pub const KEY_VOLUME: &str = "@VOL";
/// Input source.
pub const KEY_SOURCE: &str = "@SRC";
/// Test tone.
pub const KEY_TEST_TONE: &str = "@TTO";

const QUERY: &str = "?";
const ON: &str = "2";
const OFF: &str = "1";

/// Highest selectable source index.
pub const MAX_SOURCE: u8 = 23;

/// Largest volume magnitude the wire format can carry, in tenths of a dB.
pub const MAX_VOLUME_MAGNITUDE: i16 = 999;

/// Source characters, indexed by source number.
const SOURCE_CHARS: &[u8; 24] = b"0123456789ABCDEFGHIJKLMN";

/// Relative volume change requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStep {
    Up,
    Down,
    UpFast,
    DownFast,
}

impl VolumeStep {
    fn code(self) -> &'static str {
        match self {
            VolumeStep::Up => "1",
            VolumeStep::Down => "2",
            VolumeStep::UpFast => "3",
            VolumeStep::DownFast => "4",
        }
    }
}

// ---------------------------------------------------------------
// Command builders
// ---------------------------------------------------------------

/// Build a "read power state" command (`@PWR:?`).
pub fn cmd_read_power() -> String {
    encode_command(KEY_POWER, QUERY)
}

/// Build a "set power" command (`@PWR:2` on, `@PWR:1` standby).
pub fn cmd_set_power(on: bool) -> String {
    encode_command(KEY_POWER, if on { ON } else { OFF })
}

/// Build a "read mute state" command (`@AMT:?`).
pub fn cmd_read_mute() -> String {
    encode_command(KEY_MUTE, QUERY)
}

/// Build a "set mute" command (`@AMT:2` muted, `@AMT:1` unmuted).
pub fn cmd_set_mute(muted: bool) -> String {
    encode_command(KEY_MUTE, if muted { ON } else { OFF })
}

/// Build a "read master volume" command (`@VOL:?`).
pub fn cmd_read_volume() -> String {
    encode_command(KEY_VOLUME, QUERY)
}

/// Build a "set master volume" command.
///
/// The argument is `0` followed by the signed volume in tenths of a dB,
/// zero-padded to three digits: `@VOL:0+215` is +21.5 dB, `@VOL:0-350` is
/// -35.0 dB. Zero is sent as `@VOL:00`.
///
/// # Arguments
///
/// * `db_tenths` - Volume in tenths of a decibel, within ±99.9 dB.
pub fn cmd_set_volume(db_tenths: i16) -> Result<String> {
    if db_tenths.unsigned_abs() > MAX_VOLUME_MAGNITUDE as u16 {
        return Err(Error::InvalidParameter(format!(
            "volume {db_tenths} tenths of a dB is outside ±{MAX_VOLUME_MAGNITUDE}"
        )));
    }
    let arg = match db_tenths {
        0 => "00".to_string(),
        v if v > 0 => format!("0+{v:03}"),
        v => format!("0-{:03}", v.unsigned_abs()),
    };
    Ok(encode_command(KEY_VOLUME, &arg))
}

/// Build a relative volume command (`@VOL:1` up ... `@VOL:4` down fast).
pub fn cmd_step_volume(step: VolumeStep) -> String {
    encode_command(KEY_VOLUME, step.code())
}

/// Build a "read input source" command (`@SRC:?`).
pub fn cmd_read_source() -> String {
    encode_command(KEY_SOURCE, QUERY)
}

/// Build a "select input source" command (`@SRC:x`).
///
/// Sources 0-9 are sent as digits, 10-23 as the letters `A`-`N`.
pub fn cmd_set_source(source: u8) -> Result<String> {
    let c = source_to_char(source)?;
    Ok(encode_command(KEY_SOURCE, c.encode_utf8(&mut [0u8; 4])))
}

/// Build a "toggle test tone" command (`@TTO:0`).
///
/// The receiver does not reliably answer this one, so it is sent
/// fire-and-forget.
pub fn cmd_toggle_test_tone() -> String {
    encode_command(KEY_TEST_TONE, "0")
}

// ---------------------------------------------------------------
// Response parsers
// ---------------------------------------------------------------

/// Check that `line` carries `key` and return its argument.
pub fn response_arg<'a>(line: &'a str, key: &str) -> Result<&'a str> {
    let (found, arg) = split_line(line);
    if found != key {
        return Err(Error::Protocol(format!(
            "expected {key} response, got {line:?}"
        )));
    }
    Ok(arg)
}

fn parse_on_off(data: &str, what: &str) -> Result<bool> {
    match data {
        ON => Ok(true),
        OFF => Ok(false),
        _ => Err(Error::Protocol(format!("invalid {what} state: {data:?}"))),
    }
}

/// Parse a power response argument. `2` = on, `1` = standby.
pub fn parse_power_response(data: &str) -> Result<bool> {
    parse_on_off(data, "power")
}

/// Parse a mute response argument. `2` = muted, `1` = unmuted.
pub fn parse_mute_response(data: &str) -> Result<bool> {
    parse_on_off(data, "mute")
}

/// Parse a volume response argument into tenths of a dB.
///
/// Accepts the bare signed form the receiver reports (`-350`, `+215`) as
/// well as the `0`-prefixed form used when setting (`0-350`, `0+215`, `00`).
pub fn parse_volume_response(data: &str) -> Result<i16> {
    let value = data
        .strip_prefix('0')
        .filter(|rest| rest.starts_with(['+', '-']))
        .unwrap_or(data);
    let tenths = value
        .parse::<i16>()
        .map_err(|e| Error::Protocol(format!("invalid volume: {data:?} ({e})")))?;
    if tenths.unsigned_abs() > MAX_VOLUME_MAGNITUDE as u16 {
        return Err(Error::Protocol(format!("volume out of range: {data:?}")));
    }
    Ok(tenths)
}

/// Parse a source response argument.
///
/// Two-character replies carry the video source followed by the audio
/// source; the audio source is returned.
pub fn parse_source_response(data: &str) -> Result<u8> {
    let c = data
        .chars()
        .last()
        .ok_or_else(|| Error::Protocol("empty source response".into()))?;
    char_to_source(c)
}

// ---------------------------------------------------------------
// Source mapping
// ---------------------------------------------------------------

/// Map a source number (0-23) to its wire character.
pub fn source_to_char(source: u8) -> Result<char> {
    SOURCE_CHARS
        .get(source as usize)
        .map(|&b| b as char)
        .ok_or_else(|| {
            Error::InvalidParameter(format!("source {source} out of range (0-{MAX_SOURCE})"))
        })
}

/// Map a wire character (`0`-`9`, `A`-`N`) to its source number.
pub fn char_to_source(c: char) -> Result<u8> {
    let upper = c.to_ascii_uppercase();
    SOURCE_CHARS
        .iter()
        .position(|&b| b as char == upper)
        .map(|i| i as u8)
        .ok_or_else(|| Error::Protocol(format!("invalid source character: {c:?}")))
}
