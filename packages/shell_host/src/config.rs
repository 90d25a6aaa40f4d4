use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pty_manager::PtyConfig;

// =============================================================================
// File config (figment-deserialized from defaults / shell-host.toml / env vars)
// =============================================================================
//
//   shell-host.toml:  [shell]
//                     command = "bash"
//
//   env var:          SHELL_HOST_SHELL__COMMAND=bash   (double underscore = nesting)

/// Env var set in the shell pointing at the directory the server started in.
pub const HOME_ENV: &str = "SHELL_HOST_HOME";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub shell: ShellFileConfig,
    #[serde(default)]
    pub stream: StreamFileConfig,
    #[serde(default)]
    pub monitor: MonitorFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory of static assets served for any unmatched path.
    #[serde(default)]
    pub web_dir: Option<PathBuf>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            web_dir: None,
        }
    }
}

impl ServerFileConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

/// The shell behind the PTY (lives under `[shell]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShellFileConfig {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Extra environment for the shell.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for ShellFileConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            working_dir: None,
            env: BTreeMap::new(),
            rows: default_rows(),
            cols: default_cols(),
            settle_ms: default_settle_ms(),
        }
    }
}

/// Stream processing limits (lives under `[stream]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamFileConfig {
    #[serde(default = "default_replay_limit_kb")]
    pub replay_limit_kb: usize,
    #[serde(default = "default_max_pending_kb")]
    pub max_pending_kb: usize,
}

impl Default for StreamFileConfig {
    fn default() -> Self {
        Self {
            replay_limit_kb: default_replay_limit_kb(),
            max_pending_kb: default_max_pending_kb(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorFileConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for MonitorFileConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7777
}
fn default_command() -> String {
    "zsh".to_string()
}
fn default_args() -> Vec<String> {
    vec!["-l".to_string()]
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_settle_ms() -> u64 {
    100
}
fn default_replay_limit_kb() -> usize {
    64
}
fn default_max_pending_kb() -> usize {
    1024
}
fn default_poll_interval_ms() -> u64 {
    100
}

/// Build a figment that layers: defaults → config file → SHELL_HOST_* env vars.
///
/// A missing config file is not an error.
pub fn load_config(path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("SHELL_HOST_").split("__"))
}

// =============================================================================
// Runtime config
// =============================================================================

/// Resolved settings for one [`crate::ShellHost`].
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub pty: PtyConfig,
    pub replay_limit: usize,
    pub max_pending: usize,
    pub poll_interval: Duration,
}

impl HostConfig {
    /// `launch_dir` is exported to the shell as [`HOME_ENV`].
    pub fn from_file(fc: &FileConfig, launch_dir: &Path) -> Self {
        let mut env: Vec<(String, String)> = fc
            .shell
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("TERM".to_string(), "xterm-256color".to_string()));
        env.push((HOME_ENV.to_string(), launch_dir.display().to_string()));

        Self {
            pty: PtyConfig {
                command: fc.shell.command.clone(),
                args: fc.shell.args.clone(),
                working_dir: fc.shell.working_dir.clone(),
                env,
                rows: fc.shell.rows,
                cols: fc.shell.cols,
                settle_delay: Duration::from_millis(fc.shell.settle_ms),
            },
            replay_limit: fc.stream.replay_limit_kb * 1024,
            max_pending: fc.stream.max_pending_kb * 1024,
            poll_interval: Duration::from_millis(fc.monitor.poll_interval_ms.max(1)),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default(), Path::new("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.server.port, 7777);
        assert!(fc.server.web_dir.is_none());
        assert_eq!(fc.shell.command, "zsh");
        assert_eq!(fc.shell.args, vec!["-l"]);
        assert_eq!((fc.shell.rows, fc.shell.cols), (24, 80));
        assert_eq!(fc.stream.replay_limit_kb, 64);
        assert_eq!(fc.stream.max_pending_kb, 1024);
        assert_eq!(fc.monitor.poll_interval_ms, 100);
    }

    #[test]
    fn test_bind_addr() {
        let sc = ServerFileConfig {
            host: "0.0.0.0".to_string(),
            port: 9000,
            web_dir: None,
        };
        assert_eq!(sc.bind_addr().unwrap(), "0.0.0.0:9000".parse().unwrap());

        let bad = ServerFileConfig {
            host: "not a host".to_string(),
            ..Default::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    // ── HostConfig::from_file ───────────────────────────────────────────

    #[test]
    fn test_host_config_from_file() {
        let mut fc = FileConfig::default();
        fc.shell.command = "/bin/sh".to_string();
        fc.shell.env.insert("EDITOR".to_string(), "vi".to_string());
        fc.stream.replay_limit_kb = 8;

        let hc = HostConfig::from_file(&fc, Path::new("/srv/project"));

        assert_eq!(hc.pty.command, "/bin/sh");
        assert_eq!(hc.replay_limit, 8 * 1024);
        assert_eq!(hc.max_pending, 1024 * 1024);
        assert_eq!(hc.poll_interval, Duration::from_millis(100));
        assert_eq!(hc.pty.settle_delay, Duration::from_millis(100));
        assert!(hc.pty.env.contains(&("EDITOR".to_string(), "vi".to_string())));
        assert!(
            hc.pty
                .env
                .contains(&("TERM".to_string(), "xterm-256color".to_string()))
        );
        assert!(
            hc.pty
                .env
                .contains(&(HOME_ENV.to_string(), "/srv/project".to_string()))
        );
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(&tmp.path().join("absent.toml"))
            .extract()
            .unwrap();
        assert_eq!(fc.server.port, 7777);
        assert_eq!(fc.shell.command, "zsh");
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("shell-host.toml");
        std::fs::write(
            &path,
            "[server]\nport = 8080\n\n[shell]\ncommand = \"bash\"\nargs = []\n\n[shell.env]\nLANG = \"C\"\n\n[monitor]\npoll_interval_ms = 250\n",
        )
        .unwrap();

        let fc: FileConfig = load_config(&path).extract().unwrap();

        assert_eq!(fc.server.port, 8080);
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.shell.command, "bash");
        assert!(fc.shell.args.is_empty());
        assert_eq!(fc.shell.env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(fc.monitor.poll_interval_ms, 250);
        assert_eq!(fc.stream.replay_limit_kb, 64);
    }
}
