//! The server context: one shell session, its stream state, and the viewers.
//!
//! Lock order is `stream` before the hub's viewer map. The read loop processes
//! a chunk and snapshots the viewers under `stream`; a joining viewer is
//! admitted and handed its replay under the same lock, so every chunk ends up
//! either in the replay it receives or in a broadcast it is a target of.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use inline_widgets::{StreamProcessor, WidgetRegistry};
use pty_manager::{PtyActor, PtyError, PtyHandle, PtySession, PtyState};

use crate::config::HostConfig;
use crate::error::HubError;
use crate::hub::{Delivery, Event, Frame, Hub, ViewerId, ViewerSink};
use crate::monitor::{Status, spawn_monitor};

struct ActiveSession {
    pty: PtyHandle,
    monitor: CancellationToken,
}

/// Read-only view served by `/api/state`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub pty: PtyState,
    pub status: Status,
    pub viewers: usize,
    pub widgets: usize,
    pub generation: u64,
}

pub struct ShellHost {
    config: HostConfig,
    session: tokio::sync::RwLock<ActiveSession>,
    restart_lock: tokio::sync::Mutex<()>,
    stream: Mutex<StreamProcessor>,
    /// Bumped on every restart; read loops of older sessions stop on mismatch.
    generation: AtomicU64,
    widgets: Arc<WidgetRegistry>,
    hub: Arc<Hub>,
    status: Arc<RwLock<Status>>,
    shutdown: CancellationToken,
}

impl ShellHost {
    pub async fn start(config: HostConfig) -> Result<Arc<Self>, PtyError> {
        Self::start_with_registry(config, Arc::new(WidgetRegistry::new())).await
    }

    /// Start with a caller-supplied registry, e.g. one carrying a custom refresh hook.
    pub async fn start_with_registry(
        config: HostConfig,
        widgets: Arc<WidgetRegistry>,
    ) -> Result<Arc<Self>, PtyError> {
        let PtySession { handle, output } = PtyActor::start(&config.pty).await?;
        let shutdown = CancellationToken::new();
        let monitor = shutdown.child_token();

        let host = Arc::new(Self {
            stream: Mutex::new(StreamProcessor::new(config.replay_limit, config.max_pending)),
            config,
            session: tokio::sync::RwLock::new(ActiveSession {
                pty: handle.clone(),
                monitor: monitor.clone(),
            }),
            restart_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            widgets,
            hub: Arc::new(Hub::new()),
            status: Arc::new(RwLock::new(Status::Waiting)),
            shutdown,
        });

        host.spawn_session_tasks(handle, output, 0, monitor);
        info!(shell_pgid = host.pty().await.shell_group(), "shell host ready");
        Ok(host)
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn widgets(&self) -> &Arc<WidgetRegistry> {
        &self.widgets
    }

    pub fn status(&self) -> Status {
        *self.status.read()
    }

    /// Handle of the current session.
    pub async fn pty(&self) -> PtyHandle {
        self.session.read().await.pty.clone()
    }

    /// Forward viewer input to the shell untouched.
    pub async fn write_input(&self, data: &[u8]) -> Result<usize, PtyError> {
        self.pty().await.write(data).await
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.pty().await.resize(rows, cols).await
    }

    /// Attach a viewer: it receives the replay buffer, then `ready`, then live output.
    pub fn attach(&self, sink: ViewerSink) -> Result<ViewerId, HubError> {
        self.hub.register(sink, |admission| {
            let stream = self.stream.lock();
            admission.admit(stream.replay_snapshot());
        })
    }

    pub fn detach(&self, id: ViewerId) {
        self.hub.unregister(id);
    }

    /// Replace the shell with a fresh one.
    ///
    /// The new session is started before the old one is touched; if that
    /// fails the old session keeps running and the error is returned.
    pub async fn restart(self: &Arc<Self>) -> Result<(), PtyError> {
        let _guard = self.restart_lock.lock().await;

        let PtySession { handle, output } = PtyActor::start(&self.config.pty).await?;
        let monitor = self.shutdown.child_token();

        let generation = {
            let mut stream = self.stream.lock();
            stream.reset();
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let old = {
            let mut session = self.session.write().await;
            std::mem::replace(
                &mut *session,
                ActiveSession {
                    pty: handle.clone(),
                    monitor: monitor.clone(),
                },
            )
        };
        old.monitor.cancel();
        old.pty.close().await;

        let previous = std::mem::take(&mut *self.status.write());
        if previous != Status::Waiting {
            self.hub.broadcast_event(
                &Event::Status {
                    state: Status::Waiting,
                },
                Delivery::BestEffort,
            );
        }

        info!(
            generation,
            shell_pgid = handle.shell_group(),
            "shell restarted"
        );
        self.spawn_session_tasks(handle, output, generation, monitor);
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, PtyError> {
        let pty = self.pty().await.state().await?;
        Ok(SessionSnapshot {
            pty,
            status: self.status(),
            viewers: self.hub.len(),
            widgets: self.widgets.len(),
            generation: self.generation.load(Ordering::SeqCst),
        })
    }

    /// Stop the monitor and close the shell.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pty().await.close().await;
        info!("shell host stopped");
    }

    fn spawn_session_tasks(
        self: &Arc<Self>,
        pty: PtyHandle,
        output: mpsc::Receiver<Vec<u8>>,
        generation: u64,
        monitor: CancellationToken,
    ) {
        spawn_monitor(
            pty,
            self.hub.clone(),
            self.status.clone(),
            self.config.poll_interval,
            monitor,
        );
        tokio::spawn(self.clone().read_loop(output, generation));
    }

    async fn read_loop(self: Arc<Self>, mut output: mpsc::Receiver<Vec<u8>>, generation: u64) {
        while let Some(chunk) = output.recv().await {
            let (processed, targets) = {
                let mut stream = self.stream.lock();
                if self.generation.load(Ordering::SeqCst) != generation {
                    debug!(generation, "discarding output of replaced session");
                    break;
                }
                let processed = stream.process(&chunk, &self.widgets);
                (processed, self.hub.snapshot())
            };

            if !processed.data.is_empty() {
                self.hub.broadcast_to(
                    &targets,
                    Frame::Binary(Bytes::from(processed.data)),
                    Delivery::Critical,
                );
            }
            // viewers admitted after this chunk already have the link in their replay
            for widget_id in processed.widgets {
                self.hub.broadcast_event_to(
                    &targets,
                    &Event::Html { widget_id },
                    Delivery::BestEffort,
                );
            }
        }

        if self.generation.load(Ordering::SeqCst) == generation {
            warn!(generation, "shell output ended");
        } else {
            debug!(generation, "read loop of replaced session finished");
        }
    }
}
