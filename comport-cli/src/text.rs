//! Text handling for bytes coming off the wire.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// Decode as much of `pending` as possible.
///
/// Invalid sequences become `�`; an incomplete sequence at the end stays in
/// `pending` until more bytes arrive.
pub fn drain_utf8_lossy(pending: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(pending) {
            Ok(valid) => {
                output.push_str(valid);
                pending.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&pending[..valid_up_to]) {
                    output.push_str(valid);
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('�');
                        let drain_to = valid_up_to
                            .saturating_add(invalid_len)
                            .min(pending.len());
                        pending.drain(..drain_to);
                    },
                    None => {
                        pending.drain(..valid_up_to);
                        break;
                    },
                }
            },
        }
    }

    output
}

fn timestamp_prefix() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let total_secs = now.as_secs();
    format!(
        "\x1b[90m[{:02}:{:02}:{:02}.{:03}]\x1b[0m ",
        (total_secs / 3600) % 24,
        (total_secs / 60) % 60,
        total_secs % 60,
        now.subsec_millis()
    )
}

/// Turns received chunks into terminal output.
///
/// Line endings are normalized to `\r\n` so output stays aligned in raw
/// mode, and an optional timestamp starts every line.
#[derive(Debug)]
pub struct TerminalText {
    pending: Vec<u8>,
    at_line_start: bool,
}

impl Default for TerminalText {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            at_line_start: true,
        }
    }
}

impl TerminalText {
    /// Decode `chunk` and format whatever is complete.
    ///
    /// Returns the decoded text (for logging) and the formatted output.
    pub fn feed(&mut self, chunk: &[u8], timestamp: bool) -> (String, String) {
        self.pending
            .extend_from_slice(chunk);
        let decoded = drain_utf8_lossy(&mut self.pending);
        let output = self.format(&decoded, timestamp);
        (decoded, output)
    }

    /// Format already decoded text.
    pub fn format(&mut self, text: &str, timestamp: bool) -> String {
        let normalized = text
            .replace("\r\n", "\n")
            .replace('\r', "\n");
        let mut out = String::with_capacity(normalized.len() + 32);

        for c in normalized.chars() {
            if c == '\n' {
                out.push_str("\r\n");
                self.at_line_start = true;
                continue;
            }
            if self.at_line_start && timestamp {
                out.push_str(&timestamp_prefix());
            }
            self.at_line_start = false;
            out.push(c);
        }

        out
    }

    /// Whether the cursor sits at the start of a line.
    pub fn at_line_start(&self) -> bool {
        self.at_line_start
    }

    /// Note that something else (a status line) moved the cursor to a new line.
    pub fn mark_line_start(&mut self) {
        self.at_line_start = true;
    }
}

/// Parse a hex string like `"48 65 6c"`, `"48656C"` or `"0x48,0x65"`.
pub fn parse_hex(input: &str) -> Result<Vec<u8>, String> {
    let digits: String = input
        .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
        .map(|token| {
            token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token)
        })
        .collect();

    if digits.is_empty() {
        return Err("no hex digits".to_string());
    }
    if !digits.is_ascii() {
        return Err(format!("invalid hex string '{input}'"));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{input}'"));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| format!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

/// Expand `\r`, `\n`, `\t`, `\\`, `\0` and `\xNN` escapes.
pub fn unescape(input: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(
                c.encode_utf8(&mut buf)
                    .as_bytes(),
            );
            continue;
        }
        match chars.next() {
            Some('r') => out.push(b'\r'),
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some('x') => {
                let hex: String = chars
                    .by_ref()
                    .take(2)
                    .collect();
                let byte = u8::from_str_radix(&hex, 16)
                    .map_err(|_| format!("invalid escape '\\x{hex}'"))?;
                out.push(byte);
            },
            Some(other) => return Err(format!("unknown escape '\\{other}'")),
            None => return Err("trailing backslash".to_string()),
        }
    }

    Ok(out)
}

/// `48 65 6C  |Hel|` style dump, sixteen bytes per line.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for chunk in data.chunks(16) {
        for byte in chunk {
            let _ = write!(out, "{byte:02X} ");
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str(" |");
        for &byte in chunk {
            out.push(if byte.is_ascii_graphic() || byte == b' ' {
                char::from(byte)
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_utf8_lossy_replaces_invalid_bytes_and_continues() {
        let mut buf = vec![0xFF, b'A', 0xFE, b'B'];
        assert_eq!(drain_utf8_lossy(&mut buf), "�A�B");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_utf8_lossy_keeps_incomplete_suffix() {
        // '你' is E4 BD A0
        let mut buf = vec![b'A', 0xE4, 0xBD];
        assert_eq!(drain_utf8_lossy(&mut buf), "A");
        assert_eq!(buf, vec![0xE4, 0xBD]);

        buf.push(0xA0);
        assert_eq!(drain_utf8_lossy(&mut buf), "你");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_feed_joins_split_characters() {
        let mut text = TerminalText::default();
        let (decoded, output) = text.feed(&[0xE4, 0xBD], false);
        assert!(decoded.is_empty());
        assert!(output.is_empty());

        let (decoded, output) = text.feed(&[0xA0, b'\n'], false);
        assert_eq!(decoded, "你\n");
        assert_eq!(output, "你\r\n");
        assert!(text.at_line_start());
    }

    #[test]
    fn test_format_normalizes_line_endings() {
        let mut text = TerminalText::default();
        assert_eq!(text.format("a\nb\r\nc\rd", false), "a\r\nb\r\nc\r\nd");
        assert!(!text.at_line_start());
    }

    #[test]
    fn test_format_timestamps_each_line() {
        let mut text = TerminalText::default();
        let output = text.format("one\ntwo", true);
        let lines: Vec<&str> = output
            .split("\r\n")
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("\x1b[90m["));
        assert!(lines[0].ends_with("]\x1b[0m one"));
        assert!(lines[1].ends_with("]\x1b[0m two"));
    }

    #[test]
    fn test_format_no_timestamp_mid_line() {
        let mut text = TerminalText::default();
        text.format("partial", true);
        assert_eq!(text.format(" rest", true), " rest");

        text.mark_line_start();
        assert!(
            text.format("next", true)
                .starts_with("\x1b[90m[")
        );
    }

    #[test]
    fn test_parse_hex_formats() {
        assert_eq!(parse_hex("48656C").unwrap(), b"Hel");
        assert_eq!(parse_hex("48 65 6c").unwrap(), b"Hel");
        assert_eq!(parse_hex("0x48,0x65").unwrap(), b"He");
        assert_eq!(parse_hex("de:ad:BE:ef").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_parse_hex_errors() {
        assert!(parse_hex("").is_err());
        assert!(parse_hex("486").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("AT\\r\\n").unwrap(), b"AT\r\n");
        assert_eq!(unescape("a\\tb\\\\c").unwrap(), b"a\tb\\c");
        assert_eq!(unescape("\\x1B[0m").unwrap(), b"\x1b[0m");
        assert_eq!(unescape("\\0").unwrap(), vec![0]);
        assert_eq!(unescape("ü").unwrap(), "ü".as_bytes());
        assert!(unescape("bad\\q").is_err());
        assert!(unescape("trailing\\").is_err());
        assert!(unescape("\\xZZ").is_err());
    }

    #[test]
    fn test_hex_dump() {
        let dump = hex_dump(b"Hi\x00");
        assert!(dump.starts_with("48 69 00 "));
        assert!(dump.ends_with(" |Hi.|\n"));
        assert_eq!(hex_dump(&[0u8; 17]).lines().count(), 2);
    }
}
