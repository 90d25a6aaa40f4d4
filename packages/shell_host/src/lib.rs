//! Shell Host - one shell, many browser viewers
//!
//! Keeps a single shell alive behind a PTY and multiplexes it over WebSockets.
//! Late joiners catch up from a bounded replay buffer, and HTML widgets that
//! programs embed in their output are lifted out and served over HTTP.

pub mod config;
pub mod error;
pub mod handlers;
pub mod host;
pub mod hub;
pub mod monitor;
pub mod websocket;

pub use config::{FileConfig, HostConfig, load_config};
pub use error::{ApiError, HubError};
pub use handlers::router;
pub use host::{SessionSnapshot, ShellHost};
pub use hub::{Delivery, Event, Frame, Hub, ViewerId, ViewerSink};
pub use monitor::Status;
