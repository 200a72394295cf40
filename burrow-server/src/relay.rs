//! Public TCP listener relay: a long-lived byte pipe between an inbound
//! socket and a tunnel client, multiplexed over the session's WebSocket as
//! `tcp_data` frames.

use std::sync::Arc;

use burrow_protocol::{encode_tcp_bytes, Frame};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::registry::TunnelRegistry;

/// Read size for the inbound socket; one read becomes one `tcp_data` frame.
const READ_BUF_SIZE: usize = 64 * 1024;
/// Commands queued towards the socket writer task.
const WRITE_QUEUE_CAPACITY: usize = 32;

enum RelayCmd {
    Data(Vec<u8>),
    Shutdown,
}

struct RelayHandle {
    /// Token of the session this leg is bound to, for session-death teardown.
    token: String,
    cmd_tx: mpsc::Sender<RelayCmd>,
}

/// Live relay legs keyed by `conn_id`. Shared between the listener and the
/// session dispatchers.
#[derive(Default)]
pub struct RelayMap {
    inner: DashMap<String, RelayHandle>,
}

impl RelayMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write client bytes to the public socket, in dispatcher arrival order.
    pub async fn write(&self, conn_id: &str, bytes: Vec<u8>) -> bool {
        let tx = self.inner.get(conn_id).map(|h| h.cmd_tx.clone());
        match tx {
            Some(tx) => tx.send(RelayCmd::Data(bytes)).await.is_ok(),
            None => false,
        }
    }

    /// Tear one leg down (client sent `tcp_close`, or cleanup).
    pub async fn close(&self, conn_id: &str) -> bool {
        match self.inner.remove(conn_id) {
            Some((_, handle)) => {
                let _ = handle.cmd_tx.send(RelayCmd::Shutdown).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every leg bound to a dead session.
    pub async fn close_session(&self, token: &str) {
        let conn_ids: Vec<String> = self
            .inner
            .iter()
            .filter(|e| e.value().token == token)
            .map(|e| e.key().clone())
            .collect();
        for conn_id in conn_ids {
            debug!(conn_id, "closing relay leg of dead session");
            self.close(&conn_id).await;
        }
    }

    fn insert(&self, conn_id: String, token: String, cmd_tx: mpsc::Sender<RelayCmd>) {
        self.inner.insert(conn_id, RelayHandle { token, cmd_tx });
    }

    fn remove(&self, conn_id: &str) {
        self.inner.remove(conn_id);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Accept loop for the raw TCP ingress. Runs until the listener socket dies.
pub async fn run_listener(
    config: Arc<Config>,
    registry: Arc<TunnelRegistry>,
    relays: Arc<RelayMap>,
) -> anyhow::Result<()> {
    let port = match config.tcp_listen_port {
        Some(port) => port,
        None => return Ok(()),
    };
    let listener = TcpListener::bind((config.tcp_listen_host.as_str(), port)).await?;
    info!(
        host = %config.tcp_listen_host,
        port,
        target = config.tcp_target_domain.as_deref().unwrap_or("<first connected>"),
        "tcp listener relay started"
    );

    loop {
        let (socket, peer) = listener.accept().await?;
        let config = Arc::clone(&config);
        let registry = Arc::clone(&registry);
        let relays = Arc::clone(&relays);
        tokio::spawn(async move {
            debug!(%peer, "tcp relay accept");
            handle_inbound(config, registry, relays, socket).await;
        });
    }
}

async fn handle_inbound(
    config: Arc<Config>,
    registry: Arc<TunnelRegistry>,
    relays: Arc<RelayMap>,
    socket: tokio::net::TcpStream,
) {
    let session = match &config.tcp_target_domain {
        Some(domain) => registry.by_domain(domain),
        None => registry.first_connected(),
    };
    let Some(session) = session else {
        warn!("no connected tunnel for tcp relay, dropping socket");
        return;
    };

    let conn_id = Uuid::new_v4().to_string();
    let (mut read_half, write_half) = socket.into_split();

    let (cmd_tx, cmd_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    relays.insert(conn_id.clone(), session.token.clone(), cmd_tx);

    if session
        .send(Frame::TcpConnect {
            conn_id: conn_id.clone(),
        })
        .await
        .is_err()
    {
        warn!(conn_id, "session went away before tcp_connect");
        relays.remove(&conn_id);
        return;
    }

    let writer = tokio::spawn(write_loop(cmd_rx, write_half));

    // Read loop: inbound socket bytes become tcp_data frames.
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut sequence: u64 = 0;
    let close_error = loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                let frame = Frame::TcpData {
                    conn_id: conn_id.clone(),
                    data: encode_tcp_bytes(&buf[..n]),
                    sequence,
                };
                sequence += 1;
                if session.send(frame).await.is_err() {
                    break Some("session closed".to_string());
                }
            }
            Err(e) => break Some(e.to_string()),
        }
    };

    debug!(conn_id, error = ?close_error, "tcp relay inbound closed");
    let _ = session
        .send(Frame::TcpClose {
            conn_id: conn_id.clone(),
            error: close_error,
        })
        .await;
    relays.close(&conn_id).await;
    let _ = writer.await;
}

async fn write_loop(mut cmd_rx: mpsc::Receiver<RelayCmd>, mut write_half: OwnedWriteHalf) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            RelayCmd::Data(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            RelayCmd::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}
