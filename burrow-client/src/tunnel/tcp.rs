//! Raw TCP legs towards the local target, one per server-allocated conn_id.

use std::sync::Arc;

use burrow_protocol::{encode_tcp_bytes, Frame};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::ClientState;

use super::writer::FrameSender;

const READ_BUF_SIZE: usize = 64 * 1024;
const WRITE_QUEUE_CAPACITY: usize = 32;

enum LegCmd {
    Data(Vec<u8>),
    Shutdown,
}

/// Live TCP legs keyed by conn_id.
#[derive(Default)]
pub struct TcpLegs {
    inner: DashMap<String, mpsc::Sender<LegCmd>>,
}

impl TcpLegs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write server bytes into the local connection; false when the leg is
    /// unknown (already closed).
    pub async fn write(&self, conn_id: &str, bytes: Vec<u8>) -> bool {
        let tx = self.inner.get(conn_id).map(|e| e.value().clone());
        match tx {
            Some(tx) => tx.send(LegCmd::Data(bytes)).await.is_ok(),
            None => false,
        }
    }

    pub async fn close(&self, conn_id: &str) {
        if let Some((_, tx)) = self.inner.remove(conn_id) {
            let _ = tx.send(LegCmd::Shutdown).await;
        }
    }

    pub async fn close_all(&self) {
        let conn_ids: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        for conn_id in conn_ids {
            self.close(&conn_id).await;
        }
    }

    fn insert(&self, conn_id: String, tx: mpsc::Sender<LegCmd>) {
        self.inner.insert(conn_id, tx);
    }

    fn remove(&self, conn_id: &str) {
        self.inner.remove(conn_id);
    }
}

/// Open a leg to the target and start its pump tasks. Failures go back to
/// the server as an immediate `tcp_close`.
pub async fn open_leg(
    state: Arc<ClientState>,
    legs: Arc<TcpLegs>,
    conn_id: String,
    frame_tx: FrameSender,
) {
    let target = (state.target_host.as_str(), state.target_port);
    let stream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(conn_id, host = %state.target_host, port = state.target_port, error = %e,
                "tcp connect to target failed");
            let _ = frame_tx
                .send(Frame::TcpClose {
                    conn_id,
                    error: Some(e.to_string()),
                })
                .await;
            return;
        }
    };
    debug!(conn_id, host = %state.target_host, port = state.target_port, "tcp leg opened");

    let (read_half, write_half) = stream.into_split();
    let (cmd_tx, cmd_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    legs.insert(conn_id.clone(), cmd_tx);

    tokio::spawn(write_loop(
        Arc::clone(&legs),
        conn_id.clone(),
        cmd_rx,
        write_half,
        frame_tx.clone(),
    ));
    tokio::spawn(read_loop(legs, conn_id, read_half, frame_tx));
}

/// Pump target bytes up to the server as tcp_data frames.
async fn read_loop(
    legs: Arc<TcpLegs>,
    conn_id: String,
    mut read_half: OwnedReadHalf,
    frame_tx: FrameSender,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut sequence: u64 = 0;
    let error = loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                let frame = Frame::TcpData {
                    conn_id: conn_id.clone(),
                    data: encode_tcp_bytes(&buf[..n]),
                    sequence,
                };
                sequence += 1;
                if frame_tx.send(frame).await.is_err() {
                    // writer is gone; no point reporting the close either
                    legs.remove(&conn_id);
                    return;
                }
            }
            Err(e) => break Some(e.to_string()),
        }
    };

    debug!(conn_id, error = ?error, "tcp leg read side closed");
    let _ = frame_tx
        .send(Frame::TcpClose {
            conn_id: conn_id.clone(),
            error,
        })
        .await;
    legs.close(&conn_id).await;
}

/// Drain queued server bytes into the target socket.
async fn write_loop(
    legs: Arc<TcpLegs>,
    conn_id: String,
    mut cmd_rx: mpsc::Receiver<LegCmd>,
    mut write_half: OwnedWriteHalf,
    frame_tx: FrameSender,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            LegCmd::Data(bytes) => {
                if let Err(e) = write_half.write_all(&bytes).await {
                    warn!(conn_id, error = %e, "tcp leg write failed");
                    let _ = frame_tx
                        .send(Frame::TcpClose {
                            conn_id: conn_id.clone(),
                            error: Some(e.to_string()),
                        })
                        .await;
                    legs.remove(&conn_id);
                    break;
                }
            }
            LegCmd::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_leg_is_refused() {
        let legs = TcpLegs::new();
        assert!(!legs.write("missing", b"x".to_vec()).await);
    }

    #[tokio::test]
    async fn close_all_empties_the_map() {
        let legs = TcpLegs::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, _rx_b) = mpsc::channel(4);
        legs.insert("a".into(), tx_a);
        legs.insert("b".into(), tx_b);

        legs.close_all().await;
        assert!(!legs.write("a", b"x".to_vec()).await);
        assert!(!legs.write("b", b"x".to_vec()).await);
        assert!(matches!(rx_a.recv().await, Some(LegCmd::Shutdown)));
    }
}
