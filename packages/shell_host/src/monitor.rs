//! Foreground process group polling.
//!
//! While the shell sits at its prompt it is the terminal's foreground group.
//! Any other group in the foreground means a command is running.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pty_manager::{PtyError, PtyHandle};

use crate::hub::{Delivery, Event, Hub};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Waiting,
    Running,
}

pub fn classify(foreground: i32, shell: i32) -> Status {
    if foreground == shell {
        Status::Waiting
    } else {
        Status::Running
    }
}

/// Remembers the last status so only transitions are reported.
#[derive(Debug, Default)]
pub struct StatusTracker {
    current: Status,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, status: Status) -> Option<Status> {
        if status == self.current {
            return None;
        }
        self.current = status;
        Some(status)
    }

    pub fn current(&self) -> Status {
        self.current
    }
}

/// Poll `pty` every `interval` until `cancel` fires or the session closes,
/// publishing transitions to `status` and to every viewer.
pub fn spawn_monitor(
    pty: PtyHandle,
    hub: Arc<Hub>,
    status: Arc<RwLock<Status>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shell = pty.shell_group();
        let mut tracker = StatusTracker::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(shell_pgid = shell, "foreground monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let foreground = match pty.foreground_group().await {
                Ok(pgid) => pgid,
                Err(PtyError::Closed) => break,
                Err(e) => {
                    debug!("foreground query failed: {}", e);
                    continue;
                }
            };

            if let Some(next) = tracker.observe(classify(foreground, shell)) {
                info!(status = ?next, foreground_pgid = foreground, "shell status changed");
                *status.write() = next;
                hub.broadcast_event(&Event::Status { state: next }, Delivery::BestEffort);
            }
        }
        debug!(shell_pgid = shell, "foreground monitor stopped");
    })
}
