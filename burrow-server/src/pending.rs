//! Correlation tables for in-flight forwards.
//!
//! Each session owns three maps: unary resolvers, stream queues, and TCP
//! chunk accumulators. Forwarders create entries before sending; only the
//! session dispatcher mutates them; entries are destroyed by the forwarder
//! draining them, by its cancel path, or by `fail_all` when the session dies.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::ForwardError;

/// Capacity of each stream queue. A full queue makes the session loop wait,
/// which pushes backpressure onto the WebSocket read and ultimately onto the
/// client's TCP flow control.
pub const STREAM_QUEUE_CAPACITY: usize = 64;

/// Unary HTTP reply as reported by the tunnel client.
#[derive(Debug, Clone)]
pub struct UnaryResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Resolved exactly once: a reply, or the reason the session went away.
pub type UnaryResult = Result<UnaryResponse, String>;

/// One value of a streaming reply, in production order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start {
        status: u16,
        headers: HashMap<String, String>,
    },
    Chunk {
        data: String,
        sequence: u64,
    },
    End {
        error: Option<String>,
        duration_ms: u64,
        total_chunks: u64,
    },
}

/// Terminal result of a one-shot TCP dialogue.
#[derive(Debug)]
pub struct TcpOutcome {
    pub bytes: Vec<u8>,
    pub error: Option<String>,
}

struct StreamSlot {
    tx: mpsc::Sender<StreamEvent>,
    started: bool,
}

struct TcpSlot {
    chunks: Vec<Vec<u8>>,
    done: oneshot::Sender<TcpOutcome>,
}

pub struct PendingTables {
    max_pending: usize,
    unary: Mutex<HashMap<String, oneshot::Sender<UnaryResult>>>,
    streams: Mutex<HashMap<String, StreamSlot>>,
    tcp: Mutex<HashMap<String, TcpSlot>>,
}

impl PendingTables {
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending,
            unary: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            tcp: Mutex::new(HashMap::new()),
        }
    }

    fn total(&self) -> usize {
        self.unary.lock().len() + self.streams.lock().len() + self.tcp.lock().len()
    }

    fn check_capacity(&self) -> Result<(), ForwardError> {
        if self.total() >= self.max_pending {
            return Err(ForwardError::PendingLimit);
        }
        Ok(())
    }

    // ── unary ──

    pub fn create_unary(&self, id: &str) -> Result<oneshot::Receiver<UnaryResult>, ForwardError> {
        self.check_capacity()?;
        let (tx, rx) = oneshot::channel();
        self.unary.lock().insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Resolve and remove; false when no entry matched.
    pub fn resolve_unary(&self, id: &str, result: UnaryResult) -> bool {
        match self.unary.lock().remove(id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn cancel_unary(&self, id: &str) {
        self.unary.lock().remove(id);
    }

    // ── stream ──

    pub fn create_stream(&self, id: &str) -> Result<mpsc::Receiver<StreamEvent>, ForwardError> {
        self.check_capacity()?;
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
        self.streams
            .lock()
            .insert(id.to_string(), StreamSlot { tx, started: false });
        Ok(rx)
    }

    /// Push one event onto the stream queue, enforcing start-before-chunk and
    /// nothing-after-end. Mis-ordered or unmatched events are dropped (false).
    /// Awaits when the queue is full, transferring backpressure to the caller.
    pub async fn push_stream(&self, id: &str, event: StreamEvent) -> bool {
        let tx = {
            let mut streams = self.streams.lock();
            let Some(slot) = streams.get_mut(id) else {
                return false;
            };
            match &event {
                StreamEvent::Start { .. } => {
                    if slot.started {
                        debug!(id, "duplicate stream_start dropped");
                        return false;
                    }
                    slot.started = true;
                    slot.tx.clone()
                }
                StreamEvent::Chunk { .. } => {
                    if !slot.started {
                        debug!(id, "stream_chunk before stream_start dropped");
                        return false;
                    }
                    slot.tx.clone()
                }
                // end is terminal: take the slot out so nothing can follow
                StreamEvent::End { .. } => match streams.remove(id) {
                    Some(slot) => slot.tx,
                    None => return false,
                },
            }
        };
        if tx.send(event).await.is_err() {
            // consumer went away; drop the dead entry
            self.streams.lock().remove(id);
            return false;
        }
        true
    }

    pub fn cancel_stream(&self, id: &str) {
        self.streams.lock().remove(id);
    }

    // ── tcp ──

    pub fn create_tcp(&self, conn_id: &str) -> Result<oneshot::Receiver<TcpOutcome>, ForwardError> {
        self.check_capacity()?;
        let (tx, rx) = oneshot::channel();
        self.tcp.lock().insert(
            conn_id.to_string(),
            TcpSlot {
                chunks: Vec::new(),
                done: tx,
            },
        );
        Ok(rx)
    }

    /// Append one decoded segment; hands the bytes back when no entry
    /// matched so the caller can try the relay map.
    pub fn append_tcp(&self, conn_id: &str, bytes: Vec<u8>) -> Result<(), Vec<u8>> {
        match self.tcp.lock().get_mut(conn_id) {
            Some(slot) => {
                slot.chunks.push(bytes);
                Ok(())
            }
            None => Err(bytes),
        }
    }

    /// Fire the resolver with everything accumulated so far and remove the
    /// entry; false when no entry matched.
    pub fn resolve_tcp(&self, conn_id: &str, error: Option<String>) -> bool {
        match self.tcp.lock().remove(conn_id) {
            Some(slot) => {
                let bytes = slot.chunks.concat();
                slot.done.send(TcpOutcome { bytes, error }).is_ok()
            }
            None => false,
        }
    }

    pub fn cancel_tcp(&self, conn_id: &str) {
        self.tcp.lock().remove(conn_id);
    }

    // ── session death ──

    /// Terminate every entry: unary and TCP resolvers fire with
    /// "session closed", stream consumers get a terminator sentinel (or wake
    /// on the closed queue and synthesize one).
    pub fn fail_all(&self) {
        let unary: Vec<_> = self.unary.lock().drain().collect();
        for (_, tx) in unary {
            let _ = tx.send(Err("session closed".to_string()));
        }

        let streams: Vec<_> = self.streams.lock().drain().collect();
        for (_, slot) in streams {
            let _ = slot.tx.try_send(StreamEvent::End {
                error: Some("session closed".to_string()),
                duration_ms: 0,
                total_chunks: 0,
            });
            // dropping slot.tx wakes the consumer even if the queue was full
        }

        let tcp: Vec<_> = self.tcp.lock().drain().collect();
        for (_, slot) in tcp {
            let bytes = slot.chunks.concat();
            let _ = slot.done.send(TcpOutcome {
                bytes,
                error: Some("session closed".to_string()),
            });
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> PendingTables {
        PendingTables::new(16)
    }

    #[tokio::test]
    async fn unary_resolves_exactly_once_and_is_removed() {
        let tables = tables();
        let rx = tables.create_unary("req-1").unwrap();

        assert!(tables.resolve_unary(
            "req-1",
            Ok(UnaryResponse {
                status: 200,
                headers: HashMap::new(),
                body: Some("ok".into()),
                error: None,
                duration_ms: 5,
            })
        ));
        // second resolve finds nothing
        assert!(!tables.resolve_unary("req-1", Err("late".into())));
        assert!(tables.is_empty());

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.status, 200);
    }

    #[tokio::test]
    async fn unary_cancel_removes_entry() {
        let tables = tables();
        let rx = tables.create_unary("req-1").unwrap();
        tables.cancel_unary("req-1");
        assert!(tables.is_empty());
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn pending_limit_enforced() {
        let tables = PendingTables::new(2);
        let _a = tables.create_unary("a").unwrap();
        let _b = tables.create_stream("b").unwrap();
        assert!(matches!(
            tables.create_tcp("c").unwrap_err(),
            ForwardError::PendingLimit
        ));
    }

    #[tokio::test]
    async fn stream_ordering_enforced() {
        let tables = tables();
        let mut rx = tables.create_stream("s").unwrap();

        // chunk before start is dropped
        assert!(
            !tables
                .push_stream(
                    "s",
                    StreamEvent::Chunk {
                        data: "early".into(),
                        sequence: 0
                    }
                )
                .await
        );

        assert!(
            tables
                .push_stream(
                    "s",
                    StreamEvent::Start {
                        status: 200,
                        headers: HashMap::new()
                    }
                )
                .await
        );
        // duplicate start is dropped
        assert!(
            !tables
                .push_stream(
                    "s",
                    StreamEvent::Start {
                        status: 200,
                        headers: HashMap::new()
                    }
                )
                .await
        );
        assert!(
            tables
                .push_stream(
                    "s",
                    StreamEvent::Chunk {
                        data: "data: a\n\n".into(),
                        sequence: 0
                    }
                )
                .await
        );
        assert!(
            tables
                .push_stream(
                    "s",
                    StreamEvent::End {
                        error: None,
                        duration_ms: 10,
                        total_chunks: 1
                    }
                )
                .await
        );
        // nothing after end
        assert!(
            !tables
                .push_stream(
                    "s",
                    StreamEvent::Chunk {
                        data: "late".into(),
                        sequence: 1
                    }
                )
                .await
        );
        assert!(tables.is_empty());

        assert!(matches!(rx.recv().await, Some(StreamEvent::Start { .. })));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Chunk { .. })));
        assert!(matches!(rx.recv().await, Some(StreamEvent::End { .. })));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn tcp_accumulates_until_close() {
        let tables = tables();
        let rx = tables.create_tcp("c").unwrap();

        assert!(tables.append_tcp("c", b"hel".to_vec()).is_ok());
        assert!(tables.append_tcp("c", b"lo".to_vec()).is_ok());
        assert_eq!(tables.append_tcp("other", b"x".to_vec()), Err(b"x".to_vec()));
        assert!(tables.resolve_tcp("c", None));
        assert!(tables.is_empty());

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.bytes, b"hello");
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn fail_all_terminates_every_table() {
        let tables = tables();
        let unary_rx = tables.create_unary("u").unwrap();
        let mut stream_rx = tables.create_stream("s").unwrap();
        tables
            .push_stream(
                "s",
                StreamEvent::Start {
                    status: 200,
                    headers: HashMap::new(),
                },
            )
            .await;
        let tcp_rx = tables.create_tcp("c").unwrap();
        tables.append_tcp("c", b"partial".to_vec()).unwrap();

        tables.fail_all();
        assert!(tables.is_empty());

        assert_eq!(unary_rx.await.unwrap().unwrap_err(), "session closed");

        assert!(matches!(stream_rx.recv().await, Some(StreamEvent::Start { .. })));
        match stream_rx.recv().await {
            Some(StreamEvent::End { error, .. }) => {
                assert_eq!(error.as_deref(), Some("session closed"));
            }
            other => panic!("expected sentinel end, got {other:?}"),
        }
        assert!(stream_rx.recv().await.is_none());

        let outcome = tcp_rx.await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some("session closed"));
        assert_eq!(outcome.bytes, b"partial");
    }
}
