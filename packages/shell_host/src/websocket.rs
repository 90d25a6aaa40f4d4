use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::future;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::host::ShellHost;
use crate::hub::{Frame, ViewerSink};

/// Serve one viewer for the lifetime of its connection.
///
/// Output reaches the viewer through the hub; this task only pumps inbound
/// frames into the shell. Binary and text frames are both written verbatim.
pub async fn handle_websocket(socket: WebSocket, host: Arc<ShellHost>) {
    let (sender, mut receiver) = socket.split();

    let sink: ViewerSink = Box::pin(
        sender
            .with(|frame: Frame| future::ready(Ok::<_, axum::Error>(Message::from(frame))))
            .sink_map_err(|e| HubError::Send(e.to_string())),
    );

    let viewer_id = match host.attach(sink) {
        Ok(id) => id,
        Err(e) => {
            warn!("viewer could not be attached: {}", e);
            return;
        }
    };
    info!(viewer_id, "viewer connected");

    while let Some(msg) = receiver.next().await {
        let input = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(viewer_id, "websocket read failed: {}", e);
                break;
            }
        };

        if let Err(e) = host.write_input(&input).await {
            warn!(viewer_id, "failed to write viewer input, closing: {}", e);
            break;
        }
    }

    host.detach(viewer_id);
    info!(viewer_id, "viewer disconnected");
}
