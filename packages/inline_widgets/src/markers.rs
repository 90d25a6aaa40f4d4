//! Byte patterns embedded in the terminal stream.
//!
//! Producers wrap an HTML block between [`WIDGET_START`] and [`WIDGET_END`]
//! (private OSC 9001 sequences, BEL-terminated). Viewers never see the block
//! itself; it is replaced by an OSC 8 hyperlink pointing at the stored widget.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opens a widget block: `ESC ] 9001 ; HTML_START BEL`
pub const WIDGET_START: &[u8] = b"\x1b]9001;HTML_START\x07";

/// Closes a widget block: `ESC ] 9001 ; HTML_END BEL`
pub const WIDGET_END: &[u8] = b"\x1b]9001;HTML_END\x07";

/// Sequences a full-screen program emits when returning to the normal screen.
pub const ALT_SCREEN_EXIT: [&[u8]; 3] = [
    b"\x1b[?1049l", // xterm
    b"\x1b[?47l",   // older xterm
    b"\x1b[?1047l",
];

/// Process-wide widget identifier. Allocated once, never reused.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetId(pub u64);

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub fn contains_alt_screen_exit(data: &[u8]) -> bool {
    ALT_SCREEN_EXIT
        .iter()
        .any(|pattern| find(data, pattern).is_some())
}

/// Inline replacement for an extracted block: an underlined blue OSC 8 link
/// whose URI encodes the widget id.
pub fn widget_link(id: WidgetId) -> Vec<u8> {
    format!(
        "\x1b]8;;htmlwidget:{id}\x07\x1b[34;4mView HTML Output #{id}\x1b[0m\x1b]8;;\x07"
    )
    .into_bytes()
}

/// Remove every complete start/end block from `data`, discarding payloads.
///
/// Unpaired start markers are left in place. Returns the number of blocks removed.
pub fn strip_widget_blocks(data: &mut Vec<u8>) -> usize {
    let Some(first) = find(data, WIDGET_START) else {
        return 0;
    };

    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&data[..first]);
    let mut cursor = first;
    let mut removed = 0;

    while let Some(rel) = find(&data[cursor..], WIDGET_START) {
        let start = cursor + rel;
        let body = start + WIDGET_START.len();
        let Some(end_rel) = find(&data[body..], WIDGET_END) else {
            break;
        };
        out.extend_from_slice(&data[cursor..start]);
        cursor = body + end_rel + WIDGET_END.len();
        removed += 1;
    }

    if removed == 0 {
        return 0;
    }
    out.extend_from_slice(&data[cursor..]);
    *data = out;
    removed
}
