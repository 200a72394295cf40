//! Forwarders: inject one logical request into a session and collect the
//! reply — unary HTTP, streaming HTTP, or a one-shot TCP dialogue.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use burrow_protocol::{encode_tcp_bytes, Frame};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::error::ForwardError;
use crate::pending::{StreamEvent, UnaryResponse};
use crate::registry::Session;
use crate::store::NewRequestLog;
use crate::AppState;

/// HTTP-shaped result of a forward. Errors are encoded as statuses
/// (503 not connected, 504 timeout, 502 session death) so the caller always
/// gets something to put on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardOutcome {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ForwardOutcome {
    fn failure(status: u16, error: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Value::Null,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    /// Body as it should appear on an HTTP response: raw for strings, JSON
    /// text otherwise.
    pub fn body_text(&self) -> String {
        match &self.body {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// The one place forwarder failures turn into HTTP statuses.
impl From<ForwardError> for ForwardOutcome {
    fn from(e: ForwardError) -> Self {
        let status = match e {
            ForwardError::NotConnected(_) | ForwardError::PendingLimit => 503,
            ForwardError::Timeout => 504,
            ForwardError::SessionClosed => 502,
        };
        Self::failure(status, e.to_string())
    }
}

fn parse_body(body: Option<String>) -> Value {
    match body {
        None => Value::Null,
        Some(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
    }
}

/// Unary HTTP forward: one request frame, one correlated response.
pub async fn forward_unary(
    state: &AppState,
    domain: &str,
    method: &str,
    path: &str,
    headers: HashMap<String, String>,
    body: Option<String>,
    timeout_secs: u64,
) -> ForwardOutcome {
    let Some(session) = state.registry.by_domain(domain) else {
        return ForwardError::NotConnected(domain.to_string()).into();
    };

    let id = Uuid::new_v4().to_string();
    let rx = match session.pending.create_unary(&id) {
        Ok(rx) => rx,
        Err(e) => return e.into(),
    };

    let frame = Frame::Request {
        id: id.clone(),
        method: method.to_string(),
        path: path.to_string(),
        headers: headers.clone(),
        body: body.clone(),
        timeout: timeout_secs,
    };
    if session.send(frame).await.is_err() {
        session.pending.cancel_unary(&id);
        return ForwardError::SessionClosed.into();
    }

    let start = Instant::now();
    let outcome = match tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await {
        Ok(Ok(Ok(reply))) => outcome_from_reply(reply),
        // the entry was failed by the dispatcher, or its resolver dropped
        // without firing; both mean the session died under us
        Ok(Ok(Err(_))) | Ok(Err(_)) => ForwardOutcome {
            duration_ms: start.elapsed().as_millis() as u64,
            ..ForwardError::SessionClosed.into()
        },
        Err(_) => {
            session.pending.cancel_unary(&id);
            ForwardOutcome {
                duration_ms: start.elapsed().as_millis() as u64,
                ..ForwardError::Timeout.into()
            }
        }
    };

    record_forward(state, &session, method, path, &headers, body.as_deref(), &outcome).await;
    outcome
}

fn outcome_from_reply(reply: UnaryResponse) -> ForwardOutcome {
    ForwardOutcome {
        status: reply.status,
        headers: reply.headers,
        body: parse_body(reply.body),
        error: reply.error,
        duration_ms: reply.duration_ms,
    }
}

/// Accounting side effects of a completed unary forward. Never affects the
/// outcome: store failures are logged and swallowed.
async fn record_forward(
    state: &AppState,
    session: &Arc<Session>,
    method: &str,
    path: &str,
    request_headers: &HashMap<String, String>,
    request_body: Option<&str>,
    outcome: &ForwardOutcome,
) {
    if let Err(e) = state.store.increment_requests(&session.token, 1).await {
        warn!(domain = %session.domain, error = %e, "request counter update failed");
    }
    let log = NewRequestLog {
        tunnel_domain: session.domain.clone(),
        method: method.to_string(),
        path: path.to_string(),
        request_headers: serde_json::to_string(request_headers).ok(),
        request_body: request_body.map(str::to_string),
        status_code: Some(i64::from(outcome.status)),
        response_headers: serde_json::to_string(&outcome.headers).ok(),
        response_body: Some(outcome.body_text()),
        error: outcome.error.clone(),
        duration_ms: outcome.duration_ms as i64,
    };
    if let Err(e) = state.store.append_request_log(log).await {
        warn!(domain = %session.domain, error = %e, "request log write failed");
    }
}

/// A lazy, finite, non-restartable sequence of stream events.
///
/// Values arrive in push order: exactly one start, chunks, exactly one end.
/// A per-value gap longer than the timeout yields a synthetic
/// `End { error: "stream timeout" }`; a dead session yields
/// `End { error: "session closed" }`. Dropping the stream removes the
/// pending entry.
pub struct TunnelStream {
    id: String,
    session: Weak<Session>,
    rx: mpsc::Receiver<StreamEvent>,
    value_timeout: Duration,
    done: bool,
}

impl TunnelStream {
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        match tokio::time::timeout(self.value_timeout, self.rx.recv()).await {
            Ok(Some(event)) => {
                if matches!(event, StreamEvent::End { .. }) {
                    self.done = true;
                }
                Some(event)
            }
            // queue closed without an end frame: the session died mid-stream
            Ok(None) => {
                self.done = true;
                Some(StreamEvent::End {
                    error: Some("session closed".to_string()),
                    duration_ms: 0,
                    total_chunks: 0,
                })
            }
            Err(_) => {
                self.done = true;
                self.cancel();
                Some(StreamEvent::End {
                    error: Some("stream timeout".to_string()),
                    duration_ms: 0,
                    total_chunks: 0,
                })
            }
        }
    }

    fn cancel(&self) {
        if let Some(session) = self.session.upgrade() {
            session.pending.cancel_stream(&self.id);
        }
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        if !self.done {
            self.cancel();
        }
    }
}

/// Streaming HTTP forward. Fails eagerly (as an outcome) when the tunnel is
/// absent or saturated; afterwards all failures surface through the stream.
pub async fn forward_stream(
    state: &AppState,
    domain: &str,
    method: &str,
    path: &str,
    headers: HashMap<String, String>,
    body: Option<String>,
    timeout_secs: u64,
) -> Result<TunnelStream, ForwardOutcome> {
    let Some(session) = state.registry.by_domain(domain) else {
        return Err(ForwardError::NotConnected(domain.to_string()).into());
    };

    let id = Uuid::new_v4().to_string();
    let rx = match session.pending.create_stream(&id) {
        Ok(rx) => rx,
        Err(e) => return Err(e.into()),
    };

    let frame = Frame::Request {
        id: id.clone(),
        method: method.to_string(),
        path: path.to_string(),
        headers,
        body,
        timeout: timeout_secs,
    };
    if session.send(frame).await.is_err() {
        session.pending.cancel_stream(&id);
        return Err(ForwardError::SessionClosed.into());
    }

    if let Err(e) = state.store.increment_requests(&session.token, 1).await {
        warn!(domain = %session.domain, error = %e, "request counter update failed");
    }

    Ok(TunnelStream {
        id,
        session: Arc::downgrade(&session),
        rx,
        value_timeout: Duration::from_secs(timeout_secs),
        done: false,
    })
}

/// One-shot TCP forward for `mode=tcp` tunnels driven by an HTTP ingress:
/// connect, push the body, accumulate reply chunks until the client closes.
pub async fn forward_tcp_unary(
    state: &AppState,
    domain: &str,
    body: Option<String>,
    timeout_secs: u64,
) -> ForwardOutcome {
    let Some(session) = state.registry.by_domain(domain) else {
        return ForwardError::NotConnected(domain.to_string()).into();
    };

    let conn_id = Uuid::new_v4().to_string();
    let rx = match session.pending.create_tcp(&conn_id) {
        Ok(rx) => rx,
        Err(e) => return e.into(),
    };

    if session
        .send(Frame::TcpConnect {
            conn_id: conn_id.clone(),
        })
        .await
        .is_err()
    {
        session.pending.cancel_tcp(&conn_id);
        return ForwardError::SessionClosed.into();
    }
    if let Some(payload) = body.as_deref().filter(|b| !b.is_empty()) {
        let frame = Frame::TcpData {
            conn_id: conn_id.clone(),
            data: encode_tcp_bytes(payload.as_bytes()),
            sequence: 0,
        };
        if session.send(frame).await.is_err() {
            session.pending.cancel_tcp(&conn_id);
            return ForwardError::SessionClosed.into();
        }
    }

    let start = Instant::now();
    let outcome = match tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await {
        Ok(Ok(reply)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            match reply.error {
                Some(error) => ForwardOutcome {
                    duration_ms,
                    ..ForwardOutcome::failure(502, error)
                },
                None => {
                    let (status, headers, body) = parse_tcp_reply(&reply.bytes);
                    ForwardOutcome {
                        status,
                        headers,
                        body,
                        error: None,
                        duration_ms,
                    }
                }
            }
        }
        Ok(Err(_)) => ForwardError::SessionClosed.into(),
        Err(_) => {
            session.pending.cancel_tcp(&conn_id);
            // best-effort: tell the client to drop the leg
            let _ = session.try_send(Frame::TcpClose {
                conn_id,
                error: Some(ForwardError::Timeout.to_string()),
            });
            ForwardOutcome {
                duration_ms: start.elapsed().as_millis() as u64,
                ..ForwardError::Timeout.into()
            }
        }
    };

    record_forward(state, &session, "TCP", "-", &HashMap::new(), body.as_deref(), &outcome).await;
    outcome
}

/// Best-effort interpretation of raw reply bytes: JSON, then an HTTP/1.x
/// response, then plain text.
fn parse_tcp_reply(bytes: &[u8]) -> (u16, HashMap<String, String>, Value) {
    let text = String::from_utf8_lossy(bytes).into_owned();

    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        return (200, HashMap::new(), value);
    }

    if text.starts_with("HTTP/") {
        let (head, body) = match text.split_once("\r\n\r\n") {
            Some((head, body)) => (head, body),
            None => (text.as_str(), ""),
        };
        let mut lines = head.lines();
        let status = lines
            .next()
            .and_then(|status_line| status_line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .unwrap_or(200);
        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        let body = serde_json::from_str(body).unwrap_or(Value::String(body.to_string()));
        return (status, headers, body);
    }

    (200, HashMap::new(), Value::String(text))
}
