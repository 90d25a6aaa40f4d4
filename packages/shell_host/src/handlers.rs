use std::path::Path;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path as UrlPath, State, ws::WebSocketUpgrade},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use maud::{DOCTYPE, html};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower_http::services::ServeDir;
use tracing::{debug, info};

use inline_widgets::WidgetId;

use crate::error::ApiError;
use crate::host::ShellHost;
use crate::websocket::handle_websocket;

/// All routes. With a `web_dir`, unmatched paths are served from it;
/// otherwise `/` renders a small status page.
pub fn router(host: Arc<ShellHost>, web_dir: Option<&Path>) -> Router {
    let app = Router::new()
        .route("/ws/shell", get(websocket_handler))
        .route("/restart", post(restart))
        .route("/resize", post(resize))
        .route("/widget/{action_id}/action", post(widget_action))
        .route("/htmlwidget/{id}", get(fetch_widget))
        .route("/health", get(health))
        .route("/api/state", get(get_state));

    let app = match web_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app.route("/", get(index)),
    };
    app.with_state(host)
}

/// Bodies are parsed by hand so a missing or wrong content type is still a
/// plain 400 rather than a 415.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {}", e)))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(host): State<Arc<ShellHost>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, host))
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

async fn get_state(State(host): State<Arc<ShellHost>>) -> Result<Response, ApiError> {
    Ok(Json(host.snapshot().await?).into_response())
}

async fn restart(State(host): State<Arc<ShellHost>>) -> Result<StatusCode, ApiError> {
    info!("restart requested");
    host.restart().await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct ResizePayload {
    rows: u16,
    cols: u16,
}

async fn resize(
    State(host): State<Arc<ShellHost>>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let payload: ResizePayload = parse_body(&body)?;
    if payload.rows == 0 || payload.cols == 0 {
        return Err(ApiError::BadRequest(format!(
            "invalid size {}x{}",
            payload.rows, payload.cols
        )));
    }
    host.resize(payload.rows, payload.cols).await?;
    debug!(rows = payload.rows, cols = payload.cols, "terminal resized");
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ActionKind {
    /// Type a command into the shell.
    Shell,
    /// Update server-side widget state.
    Internal,
}

#[derive(Debug, Deserialize)]
struct WidgetAction {
    #[serde(rename = "type")]
    kind: ActionKind,
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    state: Option<Value>,
}

async fn widget_action(
    State(host): State<Arc<ShellHost>>,
    UrlPath(action_id): UrlPath<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let action: WidgetAction = parse_body(&body)?;

    match action.kind {
        ActionKind::Shell => {
            if action.cmd.is_empty() {
                return Err(ApiError::BadRequest("missing cmd".to_string()));
            }
            let line = format!("{}\n", action.cmd);
            host.write_input(line.as_bytes()).await?;
            info!(%action_id, cmd = %action.cmd, "widget shell action");
        }
        ActionKind::Internal => {
            let record = host.widgets().upsert_action_state(&action_id, action.state);
            host.widgets().refresh(&record);
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_widget(
    State(host): State<Arc<ShellHost>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Response, ApiError> {
    let id: u64 = id
        .parse()
        .map_err(|_| ApiError::NotFound(format!("no widget {}", id)))?;
    let payload = host.widgets().fetch(WidgetId(id))?;
    Ok((
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        payload.to_vec(),
    )
        .into_response())
}

async fn index(State(host): State<Arc<ShellHost>>) -> Response {
    let snapshot = host.snapshot().await.ok();

    let markup = html! {
        (DOCTYPE)
        html {
            head { title { "shell-host" } }
            body {
                h1 { "shell-host" }
                @if let Some(s) = &snapshot {
                    p { "Shell: " code { (s.pty.command) } " (pid " (s.pty.pid.map_or("N/A".to_string(), |p| p.to_string())) ")" }
                    p { "Status: " (format!("{:?}", s.status).to_lowercase()) }
                    p { "Size: " (s.pty.cols) "\u{00d7}" (s.pty.rows) }
                    p { "Viewers: " (s.viewers) ", widgets: " (s.widgets) }
                } @else {
                    p { "Shell session unavailable" }
                }
                h2 { "Endpoints" }
                ul {
                    li { code { "GET  /ws/shell" } " terminal stream" }
                    li { code { "POST /resize" } " {\"rows\", \"cols\"}" }
                    li { code { "POST /restart" } " replace the shell" }
                    li { code { "POST /widget/{action_id}/action" } " widget callbacks" }
                    li { code { "GET  /htmlwidget/{id}" } " widget HTML" }
                    li { code { "GET  /api/state" } " session snapshot" }
                }
            }
        }
    };
    markup.into_response()
}
