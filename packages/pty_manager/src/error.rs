/// Errors that can occur during PTY session operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PtyError {
    /// Could not open the PTY or spawn the shell
    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    /// Could not read the terminal's foreground process group
    #[error("failed to query foreground process group: {0}")]
    GroupQuery(String),

    /// Write to the PTY failed
    #[error("failed to write to PTY: {0}")]
    Write(String),

    /// Resize was rejected or failed
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// The session actor is gone (closed or restarted)
    #[error("PTY session is closed")]
    Closed,
}

impl PtyError {
    /// Short machine-readable code, used in logs and API error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn",
            Self::GroupQuery(_) => "group_query",
            Self::Write(_) => "write",
            Self::Resize(_) => "resize",
            Self::Closed => "closed",
        }
    }
}
