//! Key-event encoding for terminal input.
//!
//! The terminal manager receives structured key events from the UI and
//! translates them into the byte sequences a pseudo-terminal expects.
//! Raw writes bypass this table entirely.

use serde::{Deserialize, Serialize};

/// A structured key event from the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    /// Key name ("Enter", "ArrowUp", ...) or a single printable character.
    pub key: String,
    /// Whether the Control modifier was held.
    #[serde(default)]
    pub ctrl: bool,
}

/// Encode a key event into the bytes to write to the PTY.
///
/// Returns `None` for unmapped or empty input, which callers drop
/// silently.
pub fn encode_key(event: &KeyEvent) -> Option<Vec<u8>> {
    let name = event.key.as_str();
    if name.is_empty() {
        return None;
    }

    // Ctrl+letter maps to the corresponding control code.
    if event.ctrl {
        let mut chars = name.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if c.is_ascii_alphabetic() {
                return Some(vec![c.to_ascii_uppercase() as u8 - 64]);
            }
        }
        return None;
    }

    let bytes: &[u8] = match name {
        "Enter" => b"\r",
        "Backspace" => b"\x7f",
        "Tab" => b"\t",
        "Escape" => b"\x1b",
        "ArrowUp" => b"\x1b[A",
        "ArrowDown" => b"\x1b[B",
        "ArrowRight" => b"\x1b[C",
        "ArrowLeft" => b"\x1b[D",
        _ => {
            // Single printable characters pass through as UTF-8.
            let mut chars = name.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                if !c.is_control() {
                    return Some(c.to_string().into_bytes());
                }
            }
            return None;
        }
    };

    Some(bytes.to_vec())
}
