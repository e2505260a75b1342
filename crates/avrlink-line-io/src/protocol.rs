//! Line protocol helpers: command encoding, key extraction, line framing.
//!
//! Devices on this link speak carriage-return terminated ASCII lines of the
//! form `@KEY:ARG`. There are no sequence numbers. A reply is matched to its
//! request only by the key, which is everything before the first `:`.

/// Carriage return: terminates every command and every response.
pub const TERMINATOR: u8 = b'\r';

/// Separates the key from the argument in a command or response line.
pub const SEPARATOR: char = ':';

/// Result of attempting to decode one line from a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// A complete line was decoded.
    Line {
        /// The line text without its terminator.
        line: String,
        /// Number of bytes consumed from the input buffer.
        consumed: usize,
    },

    /// A terminated chunk was found but holds no usable line (empty after
    /// stripping line feeds, or not valid UTF-8). The bytes should be discarded.
    Garbage(usize),

    /// The buffer does not yet contain a terminator. More data is needed.
    Incomplete,
}

/// Build a wire command `@NAME:ARG\r`.
///
/// A leading `@` on `name` is accepted and not doubled.
///
/// # Examples
///
/// ```
/// use avrlink_line_io::protocol::encode_command;
///
/// assert_eq!(encode_command("PWR", "?"), "@PWR:?\r");
/// assert_eq!(encode_command("@VOL", "0+215"), "@VOL:0+215\r");
/// ```
pub fn encode_command(name: &str, arg: &str) -> String {
    let name = name.strip_prefix('@').unwrap_or(name);
    format!("@{name}{SEPARATOR}{arg}\r")
}

/// Return `body` with exactly one trailing terminator.
pub fn frame(body: &str) -> String {
    let trimmed = body.trim_end_matches(['\r', '\n']);
    format!("{trimmed}\r")
}

/// Extract the correlation key from a command body or a response line.
///
/// The key is the text before the first `:`. Without a separator the whole
/// text is the key, minus any trailing line terminators.
///
/// # Examples
///
/// ```
/// use avrlink_line_io::protocol::extract_key;
///
/// assert_eq!(extract_key("@PWR:?\r"), "@PWR");
/// assert_eq!(extract_key("@VOL:0-350"), "@VOL");
/// assert_eq!(extract_key("@XYZ\r"), "@XYZ");
/// ```
pub fn extract_key(text: &str) -> &str {
    match text.find(SEPARATOR) {
        Some(pos) => &text[..pos],
        None => text.trim_end_matches(['\r', '\n']),
    }
}

/// Split a line into its key and argument.
///
/// The argument has trailing terminators removed and is empty when the line
/// has no separator.
pub fn split_line(line: &str) -> (&str, &str) {
    match line.find(SEPARATOR) {
        Some(pos) => (
            &line[..pos],
            line[pos + SEPARATOR.len_utf8()..].trim_end_matches(['\r', '\n']),
        ),
        None => (line.trim_end_matches(['\r', '\n']), ""),
    }
}

/// Decode one carriage-return terminated line from a byte buffer.
///
/// Line feeds around the line are dropped so CRLF devices work too.
/// Returns the first complete line found, or [`DecodeResult::Incomplete`]
/// if no terminator is present yet.
pub fn decode_line(buf: &[u8]) -> DecodeResult {
    let term_pos = match buf.iter().position(|&b| b == TERMINATOR) {
        Some(pos) => pos,
        None => return DecodeResult::Incomplete,
    };
    let consumed = term_pos + 1;

    let text = match std::str::from_utf8(&buf[..term_pos]) {
        Ok(s) => s.trim_matches('\n'),
        Err(_) => return DecodeResult::Garbage(consumed),
    };

    if text.is_empty() {
        return DecodeResult::Garbage(consumed);
    }

    DecodeResult::Line {
        line: text.to_string(),
        consumed,
    }
}
