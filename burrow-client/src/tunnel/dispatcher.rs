//! Frame dispatcher: reads incoming WebSocket frames and routes them.

use std::sync::Arc;
use std::time::Duration;

use burrow_protocol::{decode_tcp_bytes, Frame};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::state::ClientState;

use super::executor;
use super::tcp::{self, TcpLegs};
use super::writer::FrameSender;

/// Run the dispatcher loop, reading from the WebSocket stream.
pub async fn run<S>(
    state: Arc<ClientState>,
    mut ws_read: S,
    frame_tx: FrameSender,
) -> anyhow::Result<()>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
{
    let legs = Arc::new(TcpLegs::new());
    let mut handler_handles: Vec<JoinHandle<()>> = Vec::new();

    let read_err = loop {
        let msg = match ws_read.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => break Some(e),
            None => break None,
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                info!("received WebSocket close");
                break None;
            }
            _ => continue,
        };

        let frame = match Frame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "undecodable frame ignored");
                continue;
            }
        };

        match frame {
            Frame::Ping => {
                // try_send keeps the read loop from blocking on a congested writer
                if frame_tx.try_send(Frame::Pong).is_err() {
                    warn!("writer channel full, pong dropped");
                }
            }
            Frame::Pong => {}

            Frame::Request {
                id,
                method,
                path,
                headers,
                body,
                timeout,
            } => {
                let state = Arc::clone(&state);
                let tx = frame_tx.clone();
                handler_handles.push(tokio::spawn(async move {
                    executor::handle_request(state, id, method, path, headers, body, timeout, tx)
                        .await;
                }));
            }

            Frame::TcpConnect { conn_id } => {
                tcp::open_leg(
                    Arc::clone(&state),
                    Arc::clone(&legs),
                    conn_id,
                    frame_tx.clone(),
                )
                .await;
            }

            Frame::TcpData { conn_id, data, .. } => match decode_tcp_bytes(&data) {
                Ok(bytes) => {
                    if !legs.write(&conn_id, bytes).await {
                        warn!(conn_id, "tcp_data for unknown connection");
                        let _ = frame_tx.try_send(Frame::TcpClose {
                            conn_id,
                            error: Some("unknown connection".to_string()),
                        });
                    }
                }
                Err(e) => warn!(conn_id, error = %e, "undecodable tcp_data dropped"),
            },

            Frame::TcpClose { conn_id, error } => {
                debug!(conn_id, error = ?error, "closing tcp leg");
                legs.close(&conn_id).await;
            }

            other => {
                debug!(frame = ?other, "ignoring unexpected frame");
            }
        }

        // keep the handle list from growing without bound
        if handler_handles.len() > 64 {
            handler_handles.retain(|h| !h.is_finished());
        }
    };

    legs.close_all().await;
    drain_handlers(handler_handles).await;

    match read_err {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Wait for in-flight request handlers to finish (bounded).
async fn drain_handlers(handles: Vec<JoinHandle<()>>) {
    if handles.is_empty() {
        return;
    }
    debug!(count = handles.len(), "waiting for request handlers to finish");
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;
}
