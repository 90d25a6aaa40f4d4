use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use shell_host::{FileConfig, HostConfig, ShellHost, load_config, router};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "shell-host")]
#[command(about = "Share one long-lived shell with any number of browser viewers")]
struct Cli {
    /// Config file (missing file means defaults)
    #[arg(long, default_value = "shell-host.toml")]
    config: PathBuf,

    /// Listen address, overrides [server] host and port
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "shell_host=debug,pty_manager=debug,inline_widgets=debug,tower_http=debug,info"
    } else {
        "shell_host=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let file_config: FileConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let launch_dir = std::env::current_dir().context("failed to read working directory")?;
    let host_config = HostConfig::from_file(&file_config, &launch_dir);

    info!(
        "Starting shell: {} {:?}",
        host_config.pty.command, host_config.pty.args
    );
    let host = ShellHost::start(host_config)
        .await
        .context("failed to start shell")?;

    let app = router(host.clone(), file_config.server.web_dir.as_deref())
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let addr = match cli.addr {
        Some(addr) => addr,
        None => file_config.server.bind_addr()?,
    };
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("shell-host listening on http://{}", actual_addr);
    info!("  GET  /ws/shell                  - terminal stream");
    info!("  POST /resize                    - resize terminal");
    info!("  POST /restart                   - replace the shell");
    info!("  POST /widget/{{action_id}}/action - widget callbacks");
    info!("  GET  /htmlwidget/{{id}}           - widget HTML");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    host.shutdown().await;
    info!("Shutdown complete");
    server_result
}
