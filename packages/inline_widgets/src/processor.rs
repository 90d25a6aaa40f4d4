//! Per-chunk transformation of raw PTY output.
//!
//! A widget block may arrive split across any number of reads. The processor
//! keeps the unfinished block in `pending` and remembers how far the end
//! marker search already got, so each byte is scanned for the end marker at
//! most once.

use tracing::{debug, warn};

use crate::markers::{
    WIDGET_END, WIDGET_START, WidgetId, contains_alt_screen_exit, find, widget_link,
};
use crate::registry::WidgetRegistry;
use crate::replay::{DEFAULT_REPLAY_LIMIT, ReplayBuffer};

/// Default cap on an unfinished widget block.
pub const DEFAULT_MAX_PENDING: usize = 1024 * 1024;

/// Result of marker extraction over one chunk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Extracted {
    /// Bytes safe to show a viewer, with blocks replaced by links.
    pub data: Vec<u8>,
    /// Ids assigned to the blocks completed by this chunk, in stream order.
    pub widgets: Vec<WidgetId>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessedChunk {
    pub data: Vec<u8>,
    pub widgets: Vec<WidgetId>,
    /// The raw chunk left the alternate screen and the replay buffer was reset.
    pub replay_cleared: bool,
}

#[derive(Debug)]
pub struct StreamProcessor {
    pending: Vec<u8>,
    /// Offset into `pending` where the next end marker search may begin.
    end_search_from: usize,
    replay: ReplayBuffer,
    max_pending: usize,
}

impl StreamProcessor {
    pub fn new(replay_limit: usize, max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            end_search_from: 0,
            replay: ReplayBuffer::with_limit(replay_limit),
            max_pending,
        }
    }

    /// Run one raw chunk through extraction and the replay buffer.
    pub fn process(&mut self, chunk: &[u8], registry: &WidgetRegistry) -> ProcessedChunk {
        let Extracted { data, widgets } = self.extract(chunk, |payload| registry.store(payload));

        let replay_cleared = contains_alt_screen_exit(chunk);
        if replay_cleared {
            debug!("alternate screen exit, clearing replay buffer");
            self.replay.clear();
        }
        self.replay.append(&data);

        ProcessedChunk {
            data,
            widgets,
            replay_cleared,
        }
    }

    /// Replace complete widget blocks with links, handing each payload to
    /// `store`. An unterminated block is carried over to the next call.
    pub fn extract(
        &mut self,
        chunk: &[u8],
        mut store: impl FnMut(Vec<u8>) -> WidgetId,
    ) -> Extracted {
        self.pending.extend_from_slice(chunk);
        let buf = std::mem::take(&mut self.pending);
        // only meaningful for a block carried over, which sits at offset 0
        let mut resume = std::mem::take(&mut self.end_search_from);

        let mut out = Extracted {
            data: Vec::with_capacity(buf.len()),
            widgets: Vec::new(),
        };
        let mut cursor = 0;

        loop {
            let Some(rel) = find(&buf[cursor..], WIDGET_START) else {
                out.data.extend_from_slice(&buf[cursor..]);
                break;
            };
            let start = cursor + rel;
            out.data.extend_from_slice(&buf[cursor..start]);

            let body = start + WIDGET_START.len();
            let search_from = body.max(resume);
            resume = 0;

            match find(&buf[search_from..], WIDGET_END) {
                Some(end_rel) => {
                    let end = search_from + end_rel;
                    let id = store(buf[body..end].to_vec());
                    out.data.extend_from_slice(&widget_link(id));
                    out.widgets.push(id);
                    cursor = end + WIDGET_END.len();
                }
                None => {
                    let tail = &buf[start..];
                    if tail.len() > self.max_pending {
                        warn!(
                            bytes = tail.len(),
                            limit = self.max_pending,
                            "unterminated widget block exceeded limit, discarding"
                        );
                    } else {
                        // an end marker may still straddle the boundary
                        self.end_search_from = tail
                            .len()
                            .saturating_sub(WIDGET_END.len() - 1)
                            .max(WIDGET_START.len());
                        self.pending = tail.to_vec();
                    }
                    break;
                }
            }
        }

        out
    }

    /// Drop all carried state. Used when the session is replaced.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.end_search_from = 0;
        self.replay.clear();
    }

    pub fn replay_snapshot(&self) -> Vec<u8> {
        self.replay.snapshot()
    }

    pub fn replay(&self) -> &ReplayBuffer {
        &self.replay
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_LIMIT, DEFAULT_MAX_PENDING)
    }
}
