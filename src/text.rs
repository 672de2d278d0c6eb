//! Transcript cleanup and the fixed control sequences sessions send.

use once_cell::sync::Lazy;
use regex::Regex;

/// Toggle win32-input-mode key reporting.
pub fn win32_input_mode(enable: bool) -> &'static str {
    if enable {
        "\x1b[?9001h"
    } else {
        "\x1b[?9001l"
    }
}

/// Show or hide the cursor (DECTCEM).
pub fn cursor_visibility(visible: bool) -> &'static str {
    if visible {
        "\x1b[?25h"
    } else {
        "\x1b[?25l"
    }
}

/// Clear the screen and scrollback; `hard` resets all terminal modes first.
pub fn clear_screen(hard: bool) -> &'static str {
    if hard {
        // RIS, then home + erase display + erase scrollback
        "\x1bc\x1b[H\x1b[2J\x1b[3J"
    } else {
        "\x1b[H\x1b[2J\x1b[3J"
    }
}

static CONTROL_SEQUENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        // CSI: parameters, intermediates, final byte
        r"\x1b\[[0-?]*[ -/]*[@-~]",
        // OSC, terminated by BEL or ST (or cut off at the end of the log)
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?",
        // character set designation
        r"|\x1b[()*+][0-9A-Za-z]",
        // remaining two-byte escapes
        r"|\x1b[78=>cDEHMNOPVWXZ\\^_]",
        // BOM, zero-width space, bell, backspace
        r"|\x{FEFF}|\x{200B}|[\x07\x08]",
    ))
    .expect("control sequence pattern is valid")
});

static BLANK_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n(?:[ \t]*\n){2,}").expect("blank line pattern is valid"));

/// Remove escape sequences and invisible characters.
pub fn strip_control_sequences(text: &str) -> String {
    CONTROL_SEQUENCE.replace_all(text, "").into_owned()
}

/// Drop carriage returns, collapse runs of blank lines into one and trim.
pub fn collapse_blank_lines(text: &str) -> String {
    let text = text.replace('\r', "");
    BLANK_RUN.replace_all(&text, "\n\n").trim().to_string()
}

/// Readable form of a session transcript.
pub fn console_text(log: &str, strip: bool) -> String {
    if strip {
        collapse_blank_lines(&strip_control_sequences(log))
    } else {
        collapse_blank_lines(log)
    }
}

/// Incremental UTF-8 decoder for a byte stream with no message boundaries.
///
/// Bytes of a character split across reads are held back until the rest
/// arrives; invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        let mut input = &self.pending[..];
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    input = &[];
                    break;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        None => {
                            // incomplete tail, wait for more bytes
                            input = rest;
                            break;
                        }
                    }
                }
            }
        }

        let consumed = self.pending.len() - input.len();
        self.pending.drain(..consumed);
        out
    }

    /// Flush whatever is held back at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
