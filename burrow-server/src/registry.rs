//! In-memory index of live client sessions, keyed by token and by domain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_protocol::Frame;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::pending::PendingTables;

/// Capacity of the per-session outbound channel drained by the writer task.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Why the registry asked a session to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A `force=true` reconnect took over the token.
    Replaced,
    /// The old socket stopped answering heartbeats.
    Stale,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replaced => "replaced",
            Self::Stale => "stale",
        }
    }
}

/// What travels to the per-session writer task. A `Close` is terminal: the
/// writer emits the WebSocket close frame and exits.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Close { code: u16, reason: String },
}

#[derive(Debug, thiserror::Error)]
#[error("session closed")]
pub struct SessionGone;

/// One live, authenticated WebSocket. The outbound half is a single-writer
/// channel; everything that wants to talk to the client goes through it.
pub struct Session {
    pub tunnel_id: i64,
    pub domain: String,
    pub token: String,
    pub connected_at: DateTime<Utc>,
    pub pending: PendingTables,
    outbound: mpsc::Sender<Outbound>,
    last_heartbeat: Mutex<Instant>,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl Session {
    pub fn new(
        tunnel_id: i64,
        domain: String,
        token: String,
        outbound: mpsc::Sender<Outbound>,
        max_pending: usize,
    ) -> Arc<Self> {
        let (close_tx, _) = watch::channel(None);
        Arc::new(Self {
            tunnel_id,
            domain,
            token,
            connected_at: Utc::now(),
            pending: PendingTables::new(max_pending),
            outbound,
            last_heartbeat: Mutex::new(Instant::now()),
            close_tx,
        })
    }

    pub async fn send(&self, frame: Frame) -> Result<(), SessionGone> {
        self.outbound
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| SessionGone)
    }

    /// Non-blocking send for frames that may be dropped under congestion
    /// (heartbeats, best-effort closes).
    pub fn try_send(&self, frame: Frame) -> Result<(), SessionGone> {
        self.outbound
            .try_send(Outbound::Frame(frame))
            .map_err(|_| SessionGone)
    }

    /// Hand the writer its terminal close frame.
    pub async fn send_close(&self, code: u16, reason: &str) {
        let _ = self
            .outbound
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Healthy means the writer is still draining frames and the client
    /// answered a heartbeat recently.
    pub fn is_healthy(&self, heartbeat_timeout: Duration) -> bool {
        !self.outbound.is_closed() && self.heartbeat_age() < heartbeat_timeout
    }

    /// Ask the owning socket loop to shut this session down.
    /// send_replace stores the value even before the loop subscribes.
    pub fn request_close(&self, reason: CloseReason) {
        self.close_tx.send_replace(Some(reason));
    }

    pub fn close_signal(&self) -> watch::Receiver<Option<CloseReason>> {
        self.close_tx.subscribe()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("active session exists")]
    ActiveSessionExists,
}

#[derive(Default)]
struct Inner {
    by_token: HashMap<String, Arc<Session>>,
    domain_index: HashMap<String, String>,
}

/// Registry of live sessions. All operations serialize through one lock;
/// critical sections are plain map work, contention is O(connections).
pub struct TunnelRegistry {
    heartbeat_timeout: Duration,
    inner: Mutex<Inner>,
}

impl TunnelRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Install a freshly authenticated session.
    ///
    /// When the token is already present: a healthy old socket and
    /// `force=false` rejects the newcomer; otherwise the old session is told
    /// to close ("replaced" on force, "stale" when unhealthy) and the new one
    /// takes its place.
    pub fn register(&self, session: Arc<Session>, force: bool) -> Result<(), RegisterError> {
        let mut inner = self.inner.lock();

        if let Some(old) = inner.by_token.get(&session.token).cloned() {
            if old.is_healthy(self.heartbeat_timeout) && !force {
                return Err(RegisterError::ActiveSessionExists);
            }
            let reason = if force {
                CloseReason::Replaced
            } else {
                CloseReason::Stale
            };
            info!(domain = %old.domain, reason = reason.as_str(), "preempting old session");
            old.request_close(reason);
            inner.domain_index.remove(&old.domain);
        }

        // A regenerated token can leave a live session on the same domain
        // under the old token; evict it so the domain index stays 1:1.
        if let Some(other_token) = inner.domain_index.get(&session.domain).cloned() {
            if other_token != session.token {
                if let Some(other) = inner.by_token.remove(&other_token) {
                    other.request_close(CloseReason::Replaced);
                }
            }
        }

        inner
            .domain_index
            .insert(session.domain.clone(), session.token.clone());
        inner.by_token.insert(session.token.clone(), session);
        Ok(())
    }

    /// Remove whatever session currently holds the token.
    pub fn unregister(&self, token: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock();
        let session = inner.by_token.remove(token)?;
        inner.domain_index.remove(&session.domain);
        Some(session)
    }

    /// Remove this exact session. A preempted loop calling this does not
    /// evict its replacement, which holds the same token.
    pub fn unregister_session(&self, session: &Arc<Session>) -> bool {
        let mut inner = self.inner.lock();
        let is_current = inner
            .by_token
            .get(&session.token)
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if !is_current {
            return false;
        }
        inner.by_token.remove(&session.token);
        inner.domain_index.remove(&session.domain);
        true
    }

    pub fn by_token(&self, token: &str) -> Option<Arc<Session>> {
        self.inner.lock().by_token.get(token).cloned()
    }

    pub fn by_domain(&self, domain: &str) -> Option<Arc<Session>> {
        let inner = self.inner.lock();
        let token = inner.domain_index.get(domain)?;
        inner.by_token.get(token).cloned()
    }

    pub fn is_connected(&self, domain: &str) -> bool {
        self.inner.lock().domain_index.contains_key(domain)
    }

    pub fn list_connected(&self) -> Vec<String> {
        self.inner.lock().domain_index.keys().cloned().collect()
    }

    /// Any connected session; the TCP listener falls back to this when no
    /// target domain is configured.
    pub fn first_connected(&self) -> Option<Arc<Session>> {
        self.inner.lock().by_token.values().next().cloned()
    }

    pub fn touch_heartbeat(&self, token: &str) -> bool {
        match self.inner.lock().by_token.get(token) {
            Some(session) => {
                session.touch_heartbeat();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TunnelRegistry {
        TunnelRegistry::new(Duration::from_secs(90))
    }

    fn session(domain: &str, token: &str) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let session = Session::new(1, domain.to_string(), token.to_string(), tx, 100);
        (session, rx)
    }

    #[tokio::test]
    async fn register_and_lookup_agree() {
        let registry = registry();
        let (s1, _rx1) = session("demo", "tun_a");
        let (s2, _rx2) = session("other", "tun_b");
        registry.register(s1, false).unwrap();
        registry.register(s2, false).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.is_connected("demo"));
        assert!(!registry.is_connected("missing"));
        let by_domain = registry.by_domain("demo").unwrap();
        let by_token = registry.by_token("tun_a").unwrap();
        assert!(Arc::ptr_eq(&by_domain, &by_token));
        let mut connected = registry.list_connected();
        connected.sort();
        assert_eq!(connected, vec!["demo", "other"]);
    }

    #[tokio::test]
    async fn unregister_removes_both_indexes() {
        let registry = registry();
        let (s1, _rx) = session("demo", "tun_a");
        registry.register(s1, false).unwrap();
        assert!(registry.unregister("tun_a").is_some());
        assert_eq!(registry.len(), 0);
        assert!(registry.by_domain("demo").is_none());
        assert!(registry.by_token("tun_a").is_none());
    }

    #[tokio::test]
    async fn healthy_session_rejects_non_forced_newcomer() {
        let registry = registry();
        let (s1, _rx1) = session("demo", "tun_a");
        registry.register(Arc::clone(&s1), false).unwrap();

        let (s2, _rx2) = session("demo", "tun_a");
        let err = registry.register(s2, false).unwrap_err();
        assert!(matches!(err, RegisterError::ActiveSessionExists));
        // the original session is untouched
        assert!(Arc::ptr_eq(&registry.by_token("tun_a").unwrap(), &s1));
        assert_eq!(*s1.close_signal().borrow(), None);
    }

    #[tokio::test]
    async fn force_preempts_healthy_session() {
        let registry = registry();
        let (s1, _rx1) = session("demo", "tun_a");
        registry.register(Arc::clone(&s1), false).unwrap();

        let (s2, _rx2) = session("demo", "tun_a");
        registry.register(Arc::clone(&s2), true).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.by_token("tun_a").unwrap(), &s2));
        assert_eq!(*s1.close_signal().borrow(), Some(CloseReason::Replaced));
    }

    #[tokio::test]
    async fn dead_session_is_replaced_without_force() {
        let registry = registry();
        let (s1, rx1) = session("demo", "tun_a");
        registry.register(Arc::clone(&s1), false).unwrap();
        // writer gone: the outbound channel closes
        drop(rx1);
        assert!(!s1.is_healthy(Duration::from_secs(90)));

        let (s2, _rx2) = session("demo", "tun_a");
        registry.register(Arc::clone(&s2), false).unwrap();
        assert!(Arc::ptr_eq(&registry.by_token("tun_a").unwrap(), &s2));
        assert_eq!(*s1.close_signal().borrow(), Some(CloseReason::Stale));
    }

    #[tokio::test]
    async fn preempted_loop_does_not_evict_replacement() {
        let registry = registry();
        let (s1, _rx1) = session("demo", "tun_a");
        registry.register(Arc::clone(&s1), false).unwrap();
        let (s2, _rx2) = session("demo", "tun_a");
        registry.register(Arc::clone(&s2), true).unwrap();

        // the old loop unwinds after being preempted
        assert!(!registry.unregister_session(&s1));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister_session(&s2));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn heartbeat_touch() {
        let registry = registry();
        let (s1, _rx) = session("demo", "tun_a");
        registry.register(Arc::clone(&s1), false).unwrap();
        assert!(registry.touch_heartbeat("tun_a"));
        assert!(!registry.touch_heartbeat("tun_missing"));
        assert!(s1.heartbeat_age() < Duration::from_secs(1));
    }
}
