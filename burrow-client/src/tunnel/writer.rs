//! Dedicated WebSocket writer task.
//!
//! All frame writes go through an mpsc channel to a single writer task, so
//! concurrent request handlers and TCP legs can never interleave frames.

use burrow_protocol::Frame;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

/// Sender half, cloned by request handlers and TCP legs.
pub type FrameSender = mpsc::Sender<Frame>;

/// Spawn the writer task. Returns the sender and a JoinHandle for cleanup.
pub fn spawn_writer<S>(mut sink: S) -> (FrameSender, JoinHandle<()>)
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(256);

    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "frame serialization failed, dropped");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                error!(error = %e, "failed to write frame to WebSocket");
                break;
            }
        }
        debug!("writer task exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}
