//! JSON frame protocol for the burrow tunnel.
//!
//! Every frame is a single-line JSON object tagged by `type`, carried as a
//! text WebSocket message. Binary payloads (`tcp_data`) travel base64-encoded
//! so the framing stays text-safe for arbitrary bytes.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// WebSocket close codes used by both sides.
pub mod close_code {
    /// Normal closure (replaced session, server shutdown).
    pub const NORMAL: u16 = 1000;
    /// Policy violation (auth failure, connection rejected).
    pub const POLICY: u16 = 1008;
    /// Internal server error (protocol violation, unexpected failure).
    pub const ERROR: u16 = 1011;
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// A single protocol frame.
///
/// `id` correlates HTTP request/response/stream frames; `conn_id` correlates
/// TCP frames. Both are opaque strings allocated by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client authenticates a new session.
    Auth {
        token: String,
        #[serde(default)]
        force: bool,
        #[serde(default = "default_client_version")]
        client_version: String,
    },
    /// Server accepted the session.
    AuthOk { domain: String, tunnel_id: String },
    /// Server rejected the session; the socket closes right after.
    AuthError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Ping,
    Pong,
    /// One HTTP request injected into the tunnel.
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// Deadline in seconds the client should apply against its target.
        timeout: u64,
    },
    /// Complete unary HTTP reply.
    Response {
        id: String,
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        duration_ms: u64,
    },
    /// Streaming reply begins (SSE upstream).
    StreamStart {
        id: String,
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// One streaming chunk; `sequence` is diagnostic, ordering comes from the
    /// WebSocket itself.
    StreamChunk {
        id: String,
        data: String,
        sequence: u64,
    },
    /// Streaming reply terminates.
    StreamEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        total_chunks: u64,
    },
    /// Server asks the client to open a new logical TCP leg.
    TcpConnect { conn_id: String },
    /// One TCP segment, base64-encoded, either direction.
    TcpData {
        conn_id: String,
        data: String,
        sequence: u64,
    },
    /// Close one TCP leg, either direction.
    TcpClose {
        conn_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Frame {
    /// Encode into the single-line JSON text form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Decode from JSON text. Unknown `type` tags and missing required
    /// fields are rejected.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Encode raw bytes for a `tcp_data` frame.
pub fn encode_tcp_bytes(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode the payload of a `tcp_data` frame.
pub fn decode_tcp_bytes(data: &str) -> Result<Vec<u8>, ProtocolError> {
    BASE64.decode(data).map_err(ProtocolError::Base64)
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}
