//! Connect, authenticate, and run one tunnel session.

use std::sync::Arc;
use std::time::Duration;

use burrow_protocol::Frame;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::state::ClientState;

use super::{dispatcher, writer};

/// How long to wait for `auth_ok` after presenting the token.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one tunnel session.
pub enum TunnelOutcome {
    /// Graceful shutdown requested locally.
    Shutdown,
    /// Server went away after a successful session; reconnect.
    Disconnected,
}

/// Connect to the server's WebSocket endpoint and run until disconnected.
pub async fn connect_and_run(
    state: &Arc<ClientState>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<TunnelOutcome> {
    let url = &state.config.server_url;
    info!(%url, "connecting tunnel");

    let (ws_stream, _response) =
        tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| anyhow::anyhow!("connect timeout ({}s)", CONNECT_TIMEOUT.as_secs()))??;
    let (ws_sink, mut ws_read) = ws_stream.split();

    let (frame_tx, mut writer_handle) = writer::spawn_writer(ws_sink);

    // ── authenticate ──
    frame_tx
        .send(Frame::Auth {
            token: state.config.token.clone(),
            force: state.config.force,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .await
        .map_err(|_| anyhow::anyhow!("writer closed during auth"))?;

    let reply = tokio::time::timeout(AUTH_TIMEOUT, next_frame(&mut ws_read))
        .await
        .map_err(|_| anyhow::anyhow!("auth timeout ({}s)", AUTH_TIMEOUT.as_secs()))??;
    match reply {
        Frame::AuthOk { domain, tunnel_id } => {
            info!(%domain, %tunnel_id, "tunnel established");
        }
        Frame::AuthError { error, code } => {
            anyhow::bail!(
                "authentication failed: {error}{}",
                code.map(|c| format!(" ({c})")).unwrap_or_default()
            );
        }
        other => anyhow::bail!("unexpected auth reply: {other:?}"),
    }

    // ── dispatch until disconnect, writer death, or shutdown ──
    let state_clone = Arc::clone(state);
    let outcome = tokio::select! {
        result = dispatcher::run(state_clone, ws_read, frame_tx.clone()) => {
            match result {
                Ok(()) => TunnelOutcome::Disconnected,
                Err(e) => {
                    warn!(error = %e, "dispatcher terminated with error");
                    TunnelOutcome::Disconnected
                }
            }
        }
        _ = &mut writer_handle => {
            warn!("writer task exited, triggering reconnect");
            TunnelOutcome::Disconnected
        }
        _ = shutdown.changed() => TunnelOutcome::Shutdown,
    };

    // Drop our sender; the writer exits once the in-flight handlers drop
    // their clones too.
    drop(frame_tx);
    if !writer_handle.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(10), writer_handle).await;
    }

    info!("tunnel session ended");
    Ok(outcome)
}

/// Read messages until the next protocol frame.
async fn next_frame<S>(ws_read: &mut S) -> anyhow::Result<Frame>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws_read.next().await {
        match msg? {
            Message::Text(text) => return Ok(Frame::decode(&text)?),
            Message::Close(_) => anyhow::bail!("connection closed during handshake"),
            _ => continue,
        }
    }
    anyhow::bail!("connection ended during handshake")
}
