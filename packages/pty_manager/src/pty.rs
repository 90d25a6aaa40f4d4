use chrono::{DateTime, Utc};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::Serialize;
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::error::PtyError;

/// Number of raw output chunks buffered between the reader thread and the consumer.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

const READ_BUFFER_SIZE: usize = 4096;

/// Configuration for spawning the shell behind a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
    /// How long to wait after spawn before reading the shell's process group.
    /// The shell only becomes the foreground group once it reaches its prompt.
    pub settle_delay: Duration,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/bash".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
            settle_delay: Duration::from_millis(100),
        }
    }
}

/// Snapshot of a PTY session
#[derive(Clone, Debug, Serialize)]
pub struct PtyState {
    pub running: bool,
    pub pid: Option<u32>,
    pub shell_pgid: i32,
    pub command: String,
    pub rows: u16,
    pub cols: u16,
    pub started_at: DateTime<Utc>,
}

/// A freshly started session: the control handle plus the raw output stream.
///
/// The output receiver yields chunks exactly as read from the PTY and ends
/// when the PTY reaches EOF or the read fails (process exit or close).
pub struct PtySession {
    pub handle: PtyHandle,
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// Requests served by the session actor, each answered on its own oneshot
pub(crate) enum PtyMessage {
    Write {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PtyError>>,
    },
    Resize {
        rows: u16,
        cols: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    ForegroundGroup {
        respond_to: oneshot::Sender<Result<i32, PtyError>>,
    },
    GetState {
        respond_to: oneshot::Sender<PtyState>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to communicate with a PTY actor.
///
/// Every operation is a message to the actor, so writes and resizes against
/// one session are serialized without any lock held by the caller.
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
    shell_pgid: i32,
}

impl PtyHandle {
    /// Write data to the PTY
    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Write {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::Closed)?;
        rx.await.map_err(|_| PtyError::Closed)?
    }

    /// Resize the PTY. Zero rows or columns are rejected.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        if rows == 0 || cols == 0 {
            return Err(PtyError::Resize(format!(
                "invalid terminal size {}x{}",
                rows, cols
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Resize {
                rows,
                cols,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::Closed)?;
        rx.await.map_err(|_| PtyError::Closed)?
    }

    /// Current foreground process group of the terminal
    pub async fn foreground_group(&self) -> Result<i32, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::ForegroundGroup { respond_to: tx })
            .await
            .map_err(|_| PtyError::Closed)?;
        rx.await.map_err(|_| PtyError::Closed)?
    }

    /// Process group the shell held when it was idle at startup
    pub fn shell_group(&self) -> i32 {
        self.shell_pgid
    }

    pub async fn state(&self) -> Result<PtyState, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| PtyError::Closed)?;
        let mut state = rx.await.map_err(|_| PtyError::Closed)?;
        state.shell_pgid = self.shell_pgid;
        Ok(state)
    }

    /// Hang up the shell and drop the PTY. Best-effort; never fails.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(PtyMessage::Close { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// The PTY actor that owns the master side and the shell process
pub struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    state: PtyState,
    receiver: mpsc::Receiver<PtyMessage>,
}

impl PtyActor {
    /// Spawn the shell, wait for it to settle, and record its process group.
    pub async fn start(config: &PtyConfig) -> Result<PtySession, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(format!("failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }

        if let Some(dir) = &config.working_dir {
            debug!("Shell working directory: {}", dir);
            cmd.cwd(dir);
        }

        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning shell: {} with args: {:?}",
            config.command, config.args
        );

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Could not spawn shell '{}': {}", config.command, e);
            PtyError::Spawn(e.to_string())
        })?;
        // The slave must not outlive the spawn, or reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();
        info!("Shell started with PID: {:?}", pid);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(format!("failed to clone PTY reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(format!("failed to take PTY writer: {}", e)))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (msg_tx, msg_rx) = mpsc::channel(32);

        // Blocking reads live on their own thread; the loop ends on EOF,
        // read error, or when nobody consumes the output any more.
        std::thread::spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        info!("PTY EOF detected - shell has exited");
                        break;
                    }
                    Ok(n) => {
                        if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            debug!("PTY output receiver dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        info!("PTY read ended: {}", e);
                        break;
                    }
                }
            }
            debug!("PTY reader thread done");
        });

        let actor = Self {
            master: pair.master,
            writer,
            child,
            state: PtyState {
                running: true,
                pid,
                shell_pgid: 0,
                command: config.command.clone(),
                rows: config.rows,
                cols: config.cols,
                started_at: Utc::now(),
            },
            receiver: msg_rx,
        };

        tokio::spawn(actor.run());

        let mut handle = PtyHandle {
            sender: msg_tx,
            shell_pgid: 0,
        };

        tokio::time::sleep(config.settle_delay).await;

        let shell_pgid = match handle.foreground_group().await {
            Ok(pgid) => pgid,
            Err(e) => {
                handle.close().await;
                return Err(match e {
                    PtyError::GroupQuery(msg) => PtyError::GroupQuery(msg),
                    other => PtyError::GroupQuery(other.to_string()),
                });
            }
        };
        handle.shell_pgid = shell_pgid;
        info!("Shell process group: {}", shell_pgid);

        Ok(PtySession {
            handle,
            output: output_rx,
        })
    }

    async fn run(mut self) {
        info!(
            "Session actor running for {} (pid {:?})",
            self.state.command, self.state.pid
        );

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::Write { data, respond_to } => {
                    let _ = respond_to.send(self.handle_write(&data));
                }
                PtyMessage::Resize {
                    rows,
                    cols,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_resize(rows, cols));
                }
                PtyMessage::ForegroundGroup { respond_to } => {
                    let _ = respond_to.send(self.handle_foreground_group());
                }
                PtyMessage::GetState { respond_to } => {
                    if let Ok(Some(_)) = self.child.try_wait() {
                        self.state.running = false;
                    }
                    let _ = respond_to.send(self.state.clone());
                }
                PtyMessage::Close { respond_to } => {
                    self.handle_close();
                    let _ = respond_to.send(());
                    break;
                }
            }
        }

        info!("Session actor stopped");
    }

    fn handle_write(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        self.writer
            .write_all(data)
            .map_err(|e| PtyError::Write(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| PtyError::Write(e.to_string()))?;
        Ok(data.len())
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))?;

        self.state.rows = rows;
        self.state.cols = cols;
        Ok(())
    }

    #[cfg(unix)]
    fn handle_foreground_group(&self) -> Result<i32, PtyError> {
        self.master
            .process_group_leader()
            .ok_or_else(|| PtyError::GroupQuery("terminal has no foreground process group".into()))
    }

    #[cfg(not(unix))]
    fn handle_foreground_group(&self) -> Result<i32, PtyError> {
        Err(PtyError::GroupQuery(
            "foreground process groups are not supported on this platform".into(),
        ))
    }

    fn handle_close(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Some(pid) = self.state.pid {
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                    debug!("SIGHUP to process group {} failed: {}", pid, e);
                }
            }
        }

        if let Err(e) = self.child.kill() {
            debug!("Killing shell failed (likely already exited): {}", e);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => info!("Shell exited with status: {:?}", status),
            Ok(None) => debug!("Shell not yet reaped after close"),
            Err(e) => debug!("Could not reap shell: {}", e),
        }
        self.state.running = false;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_config() -> PtyConfig {
        PtyConfig {
            command: "/bin/sh".to_string(),
            ..Default::default()
        }
    }

    async fn read_until(output: &mut mpsc::Receiver<Vec<u8>>, needle: &str) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, output.recv()).await {
            seen.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&seen).contains(needle) {
                return true;
            }
        }
        false
    }

    #[tokio::test]
    async fn start_records_shell_group() {
        let session = PtyActor::start(&sh_config()).await.unwrap();
        assert!(session.handle.shell_group() > 0);
        let fg = session.handle.foreground_group().await.unwrap();
        assert_eq!(fg, session.handle.shell_group());
        session.handle.close().await;
    }

    #[tokio::test]
    async fn write_is_echoed_back() {
        let mut session = PtyActor::start(&sh_config()).await.unwrap();
        session.handle.write(b"echo pty-roundtrip\n").await.unwrap();
        assert!(read_until(&mut session.output, "pty-roundtrip").await);
        session.handle.close().await;
    }

    #[tokio::test]
    async fn resize_updates_state() {
        let session = PtyActor::start(&sh_config()).await.unwrap();
        session.handle.resize(40, 120).await.unwrap();
        let state = session.handle.state().await.unwrap();
        assert_eq!((state.rows, state.cols), (40, 120));
        session.handle.close().await;
    }

    #[tokio::test]
    async fn zero_size_is_rejected() {
        let session = PtyActor::start(&sh_config()).await.unwrap();
        let err = session.handle.resize(0, 80).await.unwrap_err();
        assert!(matches!(err, PtyError::Resize(_)));
        session.handle.close().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let config = PtyConfig {
            command: "/definitely/not/a/shell".to_string(),
            ..Default::default()
        };
        let err = PtyActor::start(&config).await.err().unwrap();
        assert!(matches!(err, PtyError::Spawn(_)));
    }

    #[tokio::test]
    async fn close_ends_output_and_rejects_writes() {
        let mut session = PtyActor::start(&sh_config()).await.unwrap();
        session.handle.close().await;
        assert!(matches!(
            session.handle.write(b"x").await,
            Err(PtyError::Closed)
        ));
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while session.output.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "output stream should end after close");
    }
}
