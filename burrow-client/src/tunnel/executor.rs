//! Execute relayed HTTP requests against the local target service.
//!
//! The upstream `Content-Type` decides the reply shape: `text/event-stream`
//! becomes a stream_start / stream_chunk / stream_end sequence, everything
//! else is buffered into a single response frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_protocol::Frame;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::state::ClientState;

use super::writer::FrameSender;

#[allow(clippy::too_many_arguments)]
pub async fn handle_request(
    state: Arc<ClientState>,
    id: String,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Option<String>,
    timeout: u64,
    frame_tx: FrameSender,
) {
    let start = Instant::now();
    let url = format!("{}{}", state.config.target_url.trim_end_matches('/'), path);

    // the server's per-request deadline, capped by the local limit
    let timeout = timeout.min(state.config.request_timeout);

    let method = method
        .parse::<reqwest::Method>()
        .unwrap_or(reqwest::Method::GET);
    let mut request = state
        .http
        .request(method, &url)
        .timeout(Duration::from_secs(timeout));
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = body {
        request = request.body(body);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let (status, error) = map_request_error(&e);
            warn!(id, %url, status, error = %e, "target request failed");
            let _ = frame_tx
                .send(Frame::Response {
                    id,
                    status,
                    headers: HashMap::new(),
                    body: None,
                    error: Some(error),
                    duration_ms: start.elapsed().as_millis() as u64,
                })
                .await;
            return;
        }
    };

    let status = response.status().as_u16();
    let mut resp_headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            resp_headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    if is_sse(&resp_headers) {
        stream_response(id, status, resp_headers, response, start, frame_tx).await;
        return;
    }

    let frame = match response.text().await {
        Ok(body) => Frame::Response {
            id,
            status,
            headers: resp_headers,
            body: Some(body),
            error: None,
            duration_ms: start.elapsed().as_millis() as u64,
        },
        Err(e) => Frame::Response {
            id,
            status: 500,
            headers: HashMap::new(),
            body: None,
            error: Some(format!("failed to read target response: {e}")),
            duration_ms: start.elapsed().as_millis() as u64,
        },
    };
    let _ = frame_tx.send(frame).await;
}

fn map_request_error(e: &reqwest::Error) -> (u16, String) {
    if e.is_timeout() {
        (504, "target service timeout".to_string())
    } else if e.is_connect() {
        (503, format!("target service unavailable: {e}"))
    } else {
        (500, e.to_string())
    }
}

fn is_sse(headers: &HashMap<String, String>) -> bool {
    headers
        .get("content-type")
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
}

/// Relay an SSE body: one stream_chunk per upstream chunk, then stream_end.
/// No response frame is sent on this path.
async fn stream_response(
    id: String,
    status: u16,
    headers: HashMap<String, String>,
    response: reqwest::Response,
    start: Instant,
    frame_tx: FrameSender,
) {
    if frame_tx
        .send(Frame::StreamStart {
            id: id.clone(),
            status,
            headers,
        })
        .await
        .is_err()
    {
        return;
    }
    debug!(id, status, "sse stream started");

    let mut sequence: u64 = 0;
    let mut error = None;
    let mut byte_stream = response.bytes_stream();
    while let Some(chunk) = byte_stream.next().await {
        match chunk {
            Ok(bytes) => {
                if bytes.is_empty() {
                    continue;
                }
                // invalid utf-8 is replaced rather than failing the stream
                let data = String::from_utf8_lossy(&bytes).into_owned();
                if frame_tx
                    .send(Frame::StreamChunk {
                        id: id.clone(),
                        data,
                        sequence,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                sequence += 1;
            }
            Err(e) => {
                warn!(id, error = %e, "sse stream read error");
                error = Some(e.to_string());
                break;
            }
        }
    }

    let total_chunks = sequence;
    debug!(id, total_chunks, "sse stream finished");
    let _ = frame_tx
        .send(Frame::StreamEnd {
            id,
            error,
            duration_ms: start.elapsed().as_millis() as u64,
            total_chunks,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_detection_by_content_type() {
        let mut headers = HashMap::new();
        assert!(!is_sse(&headers));
        headers.insert("content-type".to_string(), "application/json".to_string());
        assert!(!is_sse(&headers));
        headers.insert(
            "content-type".to_string(),
            "text/event-stream; charset=utf-8".to_string(),
        );
        assert!(is_sse(&headers));
        headers.insert("content-type".to_string(), "TEXT/EVENT-STREAM".to_string());
        assert!(is_sse(&headers));
    }
}
