//! Viewer membership and fan-out.
//!
//! Every viewer owns a bounded outbound queue drained by its own writer task.
//! Broadcasting only enqueues, so a slow connection delays nobody else; a
//! viewer whose queue overflows on terminal data is evicted. The registry map
//! is only locked long enough to clone the current member list.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use inline_widgets::WidgetId;

use crate::error::HubError;
use crate::monitor::Status;

pub type ViewerId = u64;

/// Outgoing half of a viewer connection.
pub type ViewerSink = Pin<Box<dyn Sink<Frame, Error = HubError> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Terminal bytes.
    Binary(Bytes),
    /// JSON control envelope.
    Text(String),
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Text(text) => Message::Text(text.into()),
        }
    }
}

/// Text envelopes sent to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Event {
    Status { state: Status },
    Html { widget_id: WidgetId },
    Ready,
}

impl Event {
    pub fn to_frame(&self) -> Result<Frame, HubError> {
        Ok(Frame::Text(serde_json::to_string(self)?))
    }
}

/// What to do with a viewer that cannot take a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Terminal data: a viewer that misses bytes is broken, drop it.
    Critical,
    /// Notifications: log and keep the viewer.
    BestEffort,
}

/// Frames a viewer may have queued before it counts as stuck.
pub const VIEWER_QUEUE_FRAMES: usize = 512;

pub struct Viewer {
    id: ViewerId,
    queue: mpsc::Sender<Frame>,
    writer: AbortHandle,
}

impl Viewer {
    pub fn id(&self) -> ViewerId {
        self.id
    }
}

/// Drain one viewer's queue into its connection.
async fn write_frames(id: ViewerId, mut sink: ViewerSink, mut queue: mpsc::Receiver<Frame>) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(viewer_id = id, "viewer write failed: {}", e);
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(viewer_id = id, "error closing viewer: {}", e);
    }
}

/// Handed to the catch-up closure of [`Hub::register`]. Calling
/// [`Admission::admit`] queues the replay and `ready`, then makes the viewer
/// visible to broadcasts.
pub struct Admission<'a> {
    hub: &'a Hub,
    viewer: Arc<Viewer>,
    ready: Frame,
}

impl Admission<'_> {
    pub fn admit(self, replay: Vec<u8>) {
        let Admission { hub, viewer, ready } = self;
        // the queue is fresh, both frames fit
        if !replay.is_empty() {
            let _ = viewer.queue.try_send(Frame::Binary(Bytes::from(replay)));
        }
        let _ = viewer.queue.try_send(ready);
        hub.viewers.write().insert(viewer.id, viewer);
    }
}

pub struct Hub {
    next_id: AtomicU64,
    viewers: RwLock<HashMap<ViewerId, Arc<Viewer>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            viewers: RwLock::new(HashMap::new()),
        }
    }

    /// Add a viewer and bring it up to date.
    ///
    /// The viewer gets its own queue and writer task. `catch_up` must call
    /// [`Admission::admit`] with the replay bytes as of that moment, under
    /// whatever lock orders it against broadcasts. Everything broadcast after
    /// admission queues behind the replay and `ready`.
    pub fn register<F>(&self, sink: ViewerSink, catch_up: F) -> Result<ViewerId, HubError>
    where
        F: FnOnce(Admission<'_>),
    {
        let ready = Event::Ready.to_frame()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, frames) = mpsc::channel(VIEWER_QUEUE_FRAMES);
        let writer = tokio::spawn(write_frames(id, sink, frames)).abort_handle();

        catch_up(Admission {
            hub: self,
            viewer: Arc::new(Viewer { id, queue, writer }),
            ready,
        });

        info!(viewer_id = id, viewers = self.len(), "viewer registered");
        Ok(id)
    }

    /// Remove a viewer. Frames already queued are still written before its
    /// connection closes. Unknown ids are ignored.
    pub fn unregister(&self, id: ViewerId) {
        if self.viewers.write().remove(&id).is_some() {
            info!(viewer_id = id, viewers = self.len(), "viewer unregistered");
        }
    }

    /// Remove a viewer and stop its writer without flushing.
    fn evict(&self, id: ViewerId) {
        let removed = self.viewers.write().remove(&id);
        if let Some(viewer) = removed {
            viewer.writer.abort();
            info!(viewer_id = id, viewers = self.len(), "viewer evicted");
        }
    }

    /// Current members, cloned under the read lock.
    pub fn snapshot(&self) -> Vec<Arc<Viewer>> {
        self.viewers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.viewers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn broadcast(&self, frame: Frame, delivery: Delivery) {
        let targets = self.snapshot();
        self.broadcast_to(&targets, frame, delivery);
    }

    pub fn broadcast_event(&self, event: &Event, delivery: Delivery) {
        let targets = self.snapshot();
        self.broadcast_event_to(&targets, event, delivery);
    }

    pub fn broadcast_event_to(&self, targets: &[Arc<Viewer>], event: &Event, delivery: Delivery) {
        match event.to_frame() {
            Ok(frame) => self.broadcast_to(targets, frame, delivery),
            Err(e) => warn!("failed to encode {:?}: {}", event, e),
        }
    }

    /// Queue a frame for a fixed member list taken earlier with
    /// [`Hub::snapshot`]. Never waits on a connection.
    pub fn broadcast_to(&self, targets: &[Arc<Viewer>], frame: Frame, delivery: Delivery) {
        for viewer in targets {
            match viewer.queue.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => {
                    debug!(viewer_id = viewer.id, "viewer writer gone");
                    self.evict(viewer.id);
                }
                Err(TrySendError::Full(_)) => match delivery {
                    Delivery::Critical => {
                        warn!(viewer_id = viewer.id, "dropping viewer with full queue");
                        self.evict(viewer.id);
                    }
                    Delivery::BestEffort => {
                        debug!(viewer_id = viewer.id, "notification not delivered, queue full");
                    }
                },
            }
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::channel::mpsc;
    use std::time::Duration;

    fn channel_sink() -> (ViewerSink, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded();
        let sink = tx.sink_map_err(|e| HubError::Send(e.to_string()));
        (Box::pin(sink), rx)
    }

    /// Sink that never finishes a send.
    fn stuck_sink() -> ViewerSink {
        Box::pin(futures::sink::unfold((), |(), _frame: Frame| {
            futures::future::pending::<Result<(), HubError>>()
        }))
    }

    /// Sink that rejects every frame.
    fn broken_sink() -> ViewerSink {
        let (tx, rx) = mpsc::unbounded::<Frame>();
        drop(rx);
        Box::pin(tx.sink_map_err(|e| HubError::Send(e.to_string())))
    }

    fn ready() -> Frame {
        Event::Ready.to_frame().unwrap()
    }

    #[test]
    fn event_envelopes() {
        let cases = [
            (Event::Ready, r#"{"kind":"ready"}"#),
            (
                Event::Status {
                    state: Status::Running,
                },
                r#"{"kind":"status","state":"running"}"#,
            ),
            (
                Event::Html {
                    widget_id: WidgetId(4),
                },
                r#"{"kind":"html","widget_id":4}"#,
            ),
        ];
        for (event, json) in cases {
            assert_eq!(event.to_frame().unwrap(), Frame::Text(json.to_string()));
        }
    }

    fn join(hub: &Hub, sink: ViewerSink, replay: &[u8]) -> ViewerId {
        hub.register(sink, |admission| admission.admit(replay.to_vec()))
            .unwrap()
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .expect("timed out waiting for a frame")
    }

    #[tokio::test]
    async fn register_sends_replay_then_ready() {
        let hub = Hub::new();
        let (sink, mut rx) = channel_sink();

        let id = join(&hub, sink, b"history");
        hub.broadcast(Frame::Binary(Bytes::from_static(b"live")), Delivery::Critical);

        assert_eq!(hub.len(), 1);
        assert_eq!(
            recv(&mut rx).await,
            Some(Frame::Binary(Bytes::from_static(b"history")))
        );
        assert_eq!(recv(&mut rx).await, Some(ready()));
        assert_eq!(
            recv(&mut rx).await,
            Some(Frame::Binary(Bytes::from_static(b"live")))
        );

        hub.unregister(id);
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn empty_replay_sends_only_ready() {
        let hub = Hub::new();
        let (sink, mut rx) = channel_sink();
        join(&hub, sink, b"");

        assert_eq!(recv(&mut rx).await, Some(ready()));
    }

    #[tokio::test]
    async fn stuck_viewer_does_not_hold_back_others() {
        let hub = Hub::new();
        let (good, mut good_rx) = channel_sink();
        join(&hub, good, b"");
        join(&hub, stuck_sink(), b"");
        assert_eq!(hub.len(), 2);

        let total = VIEWER_QUEUE_FRAMES + 8;
        for n in 0..total {
            hub.broadcast(Frame::Binary(Bytes::from(n.to_string())), Delivery::Critical);
            tokio::task::yield_now().await;
        }

        // the stuck viewer overflowed its queue and was evicted
        assert_eq!(hub.len(), 1);
        assert_eq!(recv(&mut good_rx).await, Some(ready()));
        for n in 0..total {
            assert_eq!(
                recv(&mut good_rx).await,
                Some(Frame::Binary(Bytes::from(n.to_string())))
            );
        }
    }

    #[tokio::test]
    async fn full_queue_keeps_viewer_for_notifications() {
        let hub = Hub::new();
        join(&hub, stuck_sink(), b"");

        let status = Event::Status {
            state: Status::Running,
        };
        for _ in 0..VIEWER_QUEUE_FRAMES + 8 {
            hub.broadcast_event(&status, Delivery::BestEffort);
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn failed_writer_is_evicted_on_next_broadcast() {
        let hub = Hub::new();
        let (good, mut good_rx) = channel_sink();
        join(&hub, good, b"");
        join(&hub, broken_sink(), b"");
        assert_eq!(recv(&mut good_rx).await, Some(ready()));

        // let the broken writer fail on ready and exit
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        hub.broadcast(Frame::Binary(Bytes::from_static(b"data")), Delivery::Critical);
        assert_eq!(hub.len(), 1);
        assert_eq!(
            recv(&mut good_rx).await,
            Some(Frame::Binary(Bytes::from_static(b"data")))
        );
    }

    #[tokio::test]
    async fn event_reaches_only_the_given_targets() {
        let hub = Hub::new();
        let (early, mut early_rx) = channel_sink();
        join(&hub, early, b"");
        let targets = hub.snapshot();

        let (late, mut late_rx) = channel_sink();
        let late_id = join(&hub, late, b"link");

        hub.broadcast_event_to(
            &targets,
            &Event::Html {
                widget_id: WidgetId(1),
            },
            Delivery::BestEffort,
        );
        hub.unregister(late_id);

        assert_eq!(recv(&mut early_rx).await, Some(ready()));
        assert_eq!(
            recv(&mut early_rx).await,
            Some(Frame::Text(r#"{"kind":"html","widget_id":1}"#.to_string()))
        );

        let mut late_frames = Vec::new();
        while let Some(frame) = recv(&mut late_rx).await {
            late_frames.push(frame);
        }
        assert_eq!(
            late_frames,
            vec![Frame::Binary(Bytes::from_static(b"link")), ready()]
        );
    }

    #[tokio::test]
    async fn unregister_flushes_then_closes() {
        let hub = Hub::new();
        let (sink, mut rx) = channel_sink();
        let id = join(&hub, sink, b"");
        hub.unregister(id);
        hub.unregister(id);
        assert!(hub.is_empty());

        assert_eq!(recv(&mut rx).await, Some(ready()));
        assert_eq!(recv(&mut rx).await, None);
    }
}
