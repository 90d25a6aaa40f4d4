//! Inline HTML widget protocol for a multiplexed terminal stream.
//!
//! Programs running in the shell wrap HTML between two private OSC markers.
//! [`StreamProcessor`] lifts those blocks out of the raw PTY byte stream,
//! stores them in a [`WidgetRegistry`], and substitutes a clickable OSC 8 link.
//! It also owns the [`ReplayBuffer`] used to catch up late viewers.

mod error;
pub mod markers;
pub mod processor;
pub mod registry;
pub mod replay;

pub use error::WidgetError;
pub use markers::{WIDGET_END, WIDGET_START, WidgetId, widget_link};
pub use processor::{DEFAULT_MAX_PENDING, Extracted, ProcessedChunk, StreamProcessor};
pub use registry::{ActionRecord, LogRefresh, RefreshHook, WidgetRegistry};
pub use replay::{DEFAULT_REPLAY_LIMIT, ReplayBuffer};
