//! Server-side session loop: one task per tunnel client WebSocket.
//!
//! The loop is the sole consumer of inbound frames for its connection and
//! the sole writer into the session's pending tables. Outbound frames all
//! funnel through one bounded channel drained by a dedicated writer task, so
//! interleaved JSON frames are impossible.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use burrow_protocol::{close_code, decode_tcp_bytes, Frame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::pending::{StreamEvent, UnaryResponse};
use crate::registry::{CloseReason, Outbound, Session, OUTBOUND_CAPACITY};
use crate::AppState;

/// How long a new connection gets to present its `auth` frame.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // ── handshake: first frame must be auth, within the deadline ──
    let (token, force, client_version) =
        match tokio::time::timeout(AUTH_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match Frame::decode(text.as_str()) {
                Ok(Frame::Auth {
                    token,
                    force,
                    client_version,
                }) => (token, force, client_version),
                Ok(_) | Err(_) => {
                    reject(&mut sink, "expected auth frame", None).await;
                    return;
                }
            },
            Ok(Some(Ok(_))) => {
                reject(&mut sink, "expected auth frame", None).await;
                return;
            }
            Ok(Some(Err(_))) | Ok(None) => return,
            Err(_) => {
                reject(&mut sink, "auth timeout", None).await;
                return;
            }
        };

    let record = match state.store.tunnel_by_token(&token).await {
        Ok(record) if record.enabled => record,
        Ok(_) => {
            reject(&mut sink, "tunnel disabled", None).await;
            return;
        }
        Err(StoreError::NotFound) => {
            reject(&mut sink, "invalid token", None).await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "token lookup failed");
            send_frame(
                &mut sink,
                &Frame::AuthError {
                    error: "internal error".to_string(),
                    code: None,
                },
            )
            .await;
            close(&mut sink, close_code::ERROR, "internal error").await;
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let session = Session::new(
        record.id,
        record.domain.clone(),
        record.token.clone(),
        outbound_tx,
        state.config.max_pending_requests,
    );

    if state.registry.register(Arc::clone(&session), force).is_err() {
        reject(&mut sink, "active session exists", Some("connection_exists")).await;
        return;
    }

    let auth_ok = Frame::AuthOk {
        domain: record.domain.clone(),
        tunnel_id: record.id.to_string(),
    };
    if !send_frame(&mut sink, &auth_ok).await {
        state.registry.unregister_session(&session);
        return;
    }
    if let Err(e) = state.store.touch_last_connected(&record.token).await {
        warn!(domain = %record.domain, error = %e, "last_connected update failed");
    }
    info!(
        domain = %record.domain,
        tunnel_id = record.id,
        client_version = %client_version,
        force,
        "tunnel session authenticated"
    );

    let writer = tokio::spawn(write_loop(outbound_rx, sink));

    let (code, reason) = run_session(&state, &session, &mut stream).await;

    // ── teardown: exactly this session's state, nothing else's ──
    state.registry.unregister_session(&session);
    session.pending.fail_all();
    state.relays.close_session(&session.token).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), session.send_close(code, &reason)).await;
    let _ = writer.await;
    info!(domain = %session.domain, reason = %reason, "tunnel session closed");
}

/// Receive loop; returns the close code/reason the writer should emit.
async fn run_session(
    state: &AppState,
    session: &Arc<Session>,
    stream: &mut SplitStream<WebSocket>,
) -> (u16, String) {
    let heartbeat_timeout = Duration::from_secs(state.config.heartbeat_timeout);
    let mut ping = tokio::time::interval(Duration::from_secs(state.config.heartbeat_interval));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // the interval fires immediately once

    let mut close_rx = session.close_signal();
    // a preemption may have landed before we subscribed
    if let Some(reason) = *close_rx.borrow() {
        return (close_code::NORMAL, reason.as_str().to_string());
    }

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if !dispatch(state, session, text.as_str()).await {
                        return (close_code::ERROR, "protocol violation".to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return (close_code::NORMAL, "client closed".to_string());
                }
                Some(Ok(_)) => {} // ws-level ping/pong; binary frames are not part of the protocol
                Some(Err(e)) => {
                    debug!(domain = %session.domain, error = %e, "websocket read error");
                    return (close_code::NORMAL, "transport error".to_string());
                }
            },
            _ = close_rx.changed() => {
                let reason = close_rx
                    .borrow()
                    .map(CloseReason::as_str)
                    .unwrap_or("closed");
                return (close_code::NORMAL, reason.to_string());
            }
            _ = ping.tick() => {
                if session.heartbeat_age() > heartbeat_timeout {
                    warn!(domain = %session.domain, "heartbeat timeout, closing stale session");
                    return (close_code::NORMAL, "stale".to_string());
                }
                if session.try_send(Frame::Ping).is_err() {
                    return (close_code::NORMAL, "writer closed".to_string());
                }
            }
        }
    }
}

/// Route one inbound frame. Returns false only on a protocol violation that
/// should take the whole connection down.
async fn dispatch(state: &AppState, session: &Arc<Session>, text: &str) -> bool {
    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            // unknown tags are ignored on the critical path; only frames that
            // are not JSON at all kill the connection
            if serde_json::from_str::<serde_json::Value>(text).is_ok() {
                warn!(domain = %session.domain, error = %e, "unrecognized frame ignored");
                return true;
            }
            warn!(domain = %session.domain, error = %e, "malformed frame");
            return false;
        }
    };

    match frame {
        Frame::Pong => session.touch_heartbeat(),
        Frame::Ping => {
            let _ = session.try_send(Frame::Pong);
        }
        Frame::Response {
            id,
            status,
            headers,
            body,
            error,
            duration_ms,
        } => {
            let delivered = session.pending.resolve_unary(
                &id,
                Ok(UnaryResponse {
                    status,
                    headers,
                    body,
                    error,
                    duration_ms,
                }),
            );
            if !delivered {
                debug!(id, "response for unknown request dropped");
            }
        }
        Frame::StreamStart { id, status, headers } => {
            if !session
                .pending
                .push_stream(&id, StreamEvent::Start { status, headers })
                .await
            {
                debug!(id, "stream_start without pending stream dropped");
            }
        }
        Frame::StreamChunk { id, data, sequence } => {
            if !session
                .pending
                .push_stream(&id, StreamEvent::Chunk { data, sequence })
                .await
            {
                debug!(id, sequence, "out-of-order stream_chunk dropped");
            }
        }
        Frame::StreamEnd {
            id,
            error,
            duration_ms,
            total_chunks,
        } => {
            if !session
                .pending
                .push_stream(
                    &id,
                    StreamEvent::End {
                        error,
                        duration_ms,
                        total_chunks,
                    },
                )
                .await
            {
                debug!(id, "stream_end without pending stream dropped");
            }
        }
        Frame::TcpData { conn_id, data, .. } => match decode_tcp_bytes(&data) {
            Ok(bytes) => {
                if let Err(bytes) = session.pending.append_tcp(&conn_id, bytes) {
                    if !state.relays.write(&conn_id, bytes).await {
                        warn!(conn_id, "tcp_data for unknown connection dropped");
                    }
                }
            }
            Err(e) => warn!(conn_id, error = %e, "undecodable tcp_data dropped"),
        },
        Frame::TcpClose { conn_id, error } => {
            if !session.pending.resolve_tcp(&conn_id, error) && !state.relays.close(&conn_id).await
            {
                debug!(conn_id, "tcp_close for unknown connection");
            }
        }
        other => {
            warn!(domain = %session.domain, frame = ?other, "unexpected frame ignored");
        }
    }
    true
}

/// Drain the outbound channel into the WebSocket sink. `Close` is terminal.
async fn write_loop(mut rx: mpsc::Receiver<Outbound>, mut sink: SplitSink<WebSocket, Message>) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Frame(frame) => {
                if !send_frame(&mut sink, &frame).await {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                close(&mut sink, code, &reason).await;
                break;
            }
        }
    }
    rx.close();
}

async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> bool {
    match frame.encode() {
        Ok(text) => sink.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "frame serialization failed");
            true
        }
    }
}

async fn close(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, error: &str, code: Option<&str>) {
    send_frame(
        sink,
        &Frame::AuthError {
            error: error.to_string(),
            code: code.map(str::to_string),
        },
    )
    .await;
    close(sink, close_code::POLICY, error).await;
}
