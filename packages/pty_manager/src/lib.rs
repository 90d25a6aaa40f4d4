//! PTY Manager - single shell session behind a pseudo-terminal
//!
//! Owns the shell process and its PTY through an actor, exposing a cloneable
//! [`PtyHandle`] for writes, resizes, and foreground process group queries,
//! plus a channel of raw output chunks.
//!
//! # Example
//!
//! ```no_run
//! use pty_manager::{PtyActor, PtyConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PtyConfig {
//!         command: "/bin/sh".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let mut session = PtyActor::start(&config).await.unwrap();
//!     session.handle.write(b"echo hello\n").await.unwrap();
//!
//!     while let Some(chunk) = session.output.recv().await {
//!         print!("{}", String::from_utf8_lossy(&chunk));
//!     }
//! }
//! ```

mod error;
pub mod pty;

pub use error::PtyError;
pub use pty::{PtyActor, PtyConfig, PtyHandle, PtySession, PtyState};
