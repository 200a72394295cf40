//! End-to-end tunnel flows: a real bound server driven by a scripted
//! WebSocket client speaking the wire protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use burrow_protocol::{decode_tcp_bytes, encode_tcp_bytes, Frame};
use burrow_server::config::Config;
use burrow_server::forward::{forward_stream, forward_tcp_unary, forward_unary};
use burrow_server::pending::StreamEvent;
use burrow_server::store::{Store, TunnelMode};
use burrow_server::{api, AppState};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_server(args: &[&str]) -> (AppState, SocketAddr) {
    let mut argv = vec!["burrow-server"];
    argv.extend_from_slice(args);
    let config = Config::try_parse_from(argv).unwrap();
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let state = AppState::new(config, store);
    let router = api::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (state, addr)
}

struct TestClient {
    ws: WsStream,
}

impl TestClient {
    async fn connect(addr: SocketAddr, token: &str, force: bool) -> (Self, Frame) {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/tunnel"))
            .await
            .unwrap();
        let mut client = Self { ws };
        client
            .send(Frame::Auth {
                token: token.to_string(),
                force,
                client_version: "test".to_string(),
            })
            .await;
        let reply = client.recv_frame().await.expect("auth reply");
        (client, reply)
    }

    async fn send(&mut self, frame: Frame) {
        self.ws
            .send(Message::Text(frame.encode().unwrap()))
            .await
            .unwrap();
    }

    /// Next protocol frame; None once the server closes.
    async fn recv_frame(&mut self) -> Option<Frame> {
        while let Some(msg) = self.ws.next().await {
            match msg.ok()? {
                Message::Text(text) => return Some(Frame::decode(&text).unwrap()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
        None
    }

    async fn recv_close_code(&mut self) -> Option<u16> {
        while let Some(msg) = self.ws.next().await {
            match msg.ok()? {
                Message::Close(Some(frame)) => return Some(frame.code.into()),
                Message::Close(None) => return None,
                _ => continue,
            }
        }
        None
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── S1: unary happy path ────────────────────────────────────────────────────

#[tokio::test]
async fn unary_forward_happy_path() {
    let (state, addr) = spawn_server(&[]).await;
    state
        .store
        .create_tunnel("demo", Some("tun_A".into()), None, None, TunnelMode::Http)
        .await
        .unwrap();

    let (mut client, reply) = TestClient::connect(addr, "tun_A", false).await;
    assert!(matches!(reply, Frame::AuthOk { ref domain, .. } if domain == "demo"));

    let responder = tokio::spawn(async move {
        let frame = client.recv_frame().await.unwrap();
        let Frame::Request {
            id, method, path, body, ..
        } = frame
        else {
            panic!("expected request, got {frame:?}");
        };
        assert_eq!(method, "POST");
        assert_eq!(path, "/api/echo");
        assert_eq!(body.as_deref(), Some(r#"{"message":"hi"}"#));
        client
            .send(Frame::Response {
                id,
                status: 200,
                headers: HashMap::from([(
                    "content-type".to_string(),
                    "application/json".to_string(),
                )]),
                body: Some(r#"{"echo":"hi"}"#.to_string()),
                error: None,
                duration_ms: 7,
            })
            .await;
        client
    });

    let outcome = forward_unary(
        &state,
        "demo",
        "POST",
        "/api/echo",
        HashMap::new(),
        Some(r#"{"message":"hi"}"#.to_string()),
        30,
    )
    .await;
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, json!({"echo": "hi"}));
    assert!(outcome.error.is_none());

    // accounting side effects
    let record = state.store.tunnel_by_domain("demo").await.unwrap();
    assert_eq!(record.total_requests, 1);
    assert_eq!(state.store.count_request_logs(Some("demo")).await.unwrap(), 1);

    responder.await.unwrap();
}

// ── S2: not connected ───────────────────────────────────────────────────────

#[tokio::test]
async fn unary_forward_not_connected() {
    let (state, _addr) = spawn_server(&[]).await;

    let start = Instant::now();
    let outcome =
        forward_unary(&state, "demo", "GET", "/", HashMap::new(), None, 30).await;
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(outcome.status, 503);
    assert_eq!(outcome.error.as_deref(), Some("tunnel not connected: demo"));
}

// ── S3: stream delivery ─────────────────────────────────────────────────────

#[tokio::test]
async fn stream_forward_delivers_exact_sequence() {
    let (state, addr) = spawn_server(&[]).await;
    state
        .store
        .create_tunnel("demo", Some("tun_A".into()), None, None, TunnelMode::Http)
        .await
        .unwrap();
    let (mut client, _) = TestClient::connect(addr, "tun_A", false).await;

    let mut stream = forward_stream(
        &state,
        "demo",
        "GET",
        "/events",
        HashMap::new(),
        None,
        30,
    )
    .await
    .unwrap();

    let responder = tokio::spawn(async move {
        let frame = client.recv_frame().await.unwrap();
        let Frame::Request { id, .. } = frame else {
            panic!("expected request");
        };
        client
            .send(Frame::StreamStart {
                id: id.clone(),
                status: 200,
                headers: HashMap::from([(
                    "content-type".to_string(),
                    "text/event-stream".to_string(),
                )]),
            })
            .await;
        client
            .send(Frame::StreamChunk {
                id: id.clone(),
                data: "data: a\n\n".to_string(),
                sequence: 0,
            })
            .await;
        client
            .send(Frame::StreamChunk {
                id: id.clone(),
                data: "data: b\n\n".to_string(),
                sequence: 1,
            })
            .await;
        client
            .send(Frame::StreamEnd {
                id,
                error: None,
                duration_ms: 12,
                total_chunks: 2,
            })
            .await;
        client
    });

    match stream.next().await {
        Some(StreamEvent::Start { status, .. }) => assert_eq!(status, 200),
        other => panic!("expected start, got {other:?}"),
    }
    match stream.next().await {
        Some(StreamEvent::Chunk { data, sequence }) => {
            assert_eq!(data, "data: a\n\n");
            assert_eq!(sequence, 0);
        }
        other => panic!("expected chunk 0, got {other:?}"),
    }
    match stream.next().await {
        Some(StreamEvent::Chunk { data, sequence }) => {
            assert_eq!(data, "data: b\n\n");
            assert_eq!(sequence, 1);
        }
        other => panic!("expected chunk 1, got {other:?}"),
    }
    match stream.next().await {
        Some(StreamEvent::End {
            error,
            total_chunks,
            ..
        }) => {
            assert!(error.is_none());
            assert_eq!(total_chunks, 2);
        }
        other => panic!("expected end, got {other:?}"),
    }
    assert!(stream.next().await.is_none());

    responder.await.unwrap();
}

// ── S4: preemption ──────────────────────────────────────────────────────────

#[tokio::test]
async fn preemption_policy() {
    let (state, addr) = spawn_server(&[]).await;
    state
        .store
        .create_tunnel("demo", Some("tun_T".into()), None, None, TunnelMode::Http)
        .await
        .unwrap();

    let (mut first, reply) = TestClient::connect(addr, "tun_T", false).await;
    assert!(matches!(reply, Frame::AuthOk { .. }));
    assert_eq!(state.registry.len(), 1);

    // second connection without force is rejected, first survives
    let (mut second, reply) = TestClient::connect(addr, "tun_T", false).await;
    match reply {
        Frame::AuthError { code, .. } => {
            assert_eq!(code.as_deref(), Some("connection_exists"));
        }
        other => panic!("expected auth_error, got {other:?}"),
    }
    assert_eq!(second.recv_close_code().await, Some(1008));
    assert_eq!(state.registry.len(), 1);
    assert!(state.registry.is_connected("demo"));

    // third connection with force takes over; first gets a normal close
    let (_third, reply) = TestClient::connect(addr, "tun_T", true).await;
    assert!(matches!(reply, Frame::AuthOk { .. }));
    assert_eq!(first.recv_close_code().await, Some(1000));
    wait_until(|| state.registry.len() == 1).await;
    assert!(state.registry.is_connected("demo"));
}

// ── S5: unary TCP dialogue ──────────────────────────────────────────────────

#[tokio::test]
async fn tcp_unary_forward() {
    let (state, addr) = spawn_server(&[]).await;
    state
        .store
        .create_tunnel("tcpdemo", Some("tun_T".into()), None, None, TunnelMode::Tcp)
        .await
        .unwrap();
    let (mut client, _) = TestClient::connect(addr, "tun_T", false).await;

    let responder = tokio::spawn(async move {
        let Frame::TcpConnect { conn_id } = client.recv_frame().await.unwrap() else {
            panic!("expected tcp_connect");
        };
        let Frame::TcpData { data, sequence, .. } = client.recv_frame().await.unwrap() else {
            panic!("expected tcp_data");
        };
        assert_eq!(sequence, 0);
        assert_eq!(decode_tcp_bytes(&data).unwrap(), br#"{"k":1}"#);

        client
            .send(Frame::TcpData {
                conn_id: conn_id.clone(),
                data: encode_tcp_bytes(b"HTTP/1.1 200 OK\r\n\r\n"),
                sequence: 0,
            })
            .await;
        client
            .send(Frame::TcpData {
                conn_id: conn_id.clone(),
                data: encode_tcp_bytes(b"hello"),
                sequence: 1,
            })
            .await;
        client
            .send(Frame::TcpClose {
                conn_id,
                error: None,
            })
            .await;
        client
    });

    let outcome =
        forward_tcp_unary(&state, "tcpdemo", Some(r#"{"k":1}"#.to_string()), 30).await;
    assert_eq!(outcome.status, 200);
    assert!(outcome.headers.is_empty());
    assert_eq!(outcome.body, json!("hello"));

    responder.await.unwrap();
}

// ── S6: session death mid-stream ────────────────────────────────────────────

#[tokio::test]
async fn session_death_terminates_stream() {
    let (state, addr) = spawn_server(&[]).await;
    state
        .store
        .create_tunnel("demo", Some("tun_A".into()), None, None, TunnelMode::Http)
        .await
        .unwrap();
    let (mut client, _) = TestClient::connect(addr, "tun_A", false).await;

    let mut stream = forward_stream(
        &state,
        "demo",
        "GET",
        "/events",
        HashMap::new(),
        None,
        30,
    )
    .await
    .unwrap();

    let Frame::Request { id, .. } = client.recv_frame().await.unwrap() else {
        panic!("expected request");
    };
    client
        .send(Frame::StreamStart {
            id: id.clone(),
            status: 200,
            headers: HashMap::new(),
        })
        .await;
    client
        .send(Frame::StreamChunk {
            id,
            data: "data: a\n\n".to_string(),
            sequence: 0,
        })
        .await;

    assert!(matches!(stream.next().await, Some(StreamEvent::Start { .. })));
    assert!(matches!(stream.next().await, Some(StreamEvent::Chunk { .. })));

    // the websocket drops mid-stream
    drop(client);

    match stream.next().await {
        Some(StreamEvent::End { error, .. }) => {
            assert_eq!(error.as_deref(), Some("session closed"));
        }
        other => panic!("expected synthetic end, got {other:?}"),
    }
    assert!(stream.next().await.is_none());

    // the session and its pending entries are gone
    wait_until(|| !state.registry.is_connected("demo")).await;
    assert_eq!(state.registry.len(), 0);
}

// ── auth edge cases ─────────────────────────────────────────────────────────

#[tokio::test]
async fn auth_rejects_bad_and_disabled_tokens() {
    let (state, addr) = spawn_server(&[]).await;

    let (mut client, reply) = TestClient::connect(addr, "tun_nope", false).await;
    match reply {
        Frame::AuthError { error, .. } => assert_eq!(error, "invalid token"),
        other => panic!("expected auth_error, got {other:?}"),
    }
    assert_eq!(client.recv_close_code().await, Some(1008));

    let record = state
        .store
        .create_tunnel("demo", None, None, None, TunnelMode::Http)
        .await
        .unwrap();
    state
        .store
        .update_tunnel_flags(
            "demo",
            burrow_server::store::TunnelFlags {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (mut client, reply) = TestClient::connect(addr, &record.token, false).await;
    match reply {
        Frame::AuthError { error, .. } => assert_eq!(error, "tunnel disabled"),
        other => panic!("expected auth_error, got {other:?}"),
    }
    assert_eq!(client.recv_close_code().await, Some(1008));
    assert_eq!(state.registry.len(), 0);
}

// ── heartbeat ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn server_pings_and_tracks_pongs() {
    let (state, addr) = spawn_server(&["--heartbeat-interval", "1"]).await;
    state
        .store
        .create_tunnel("demo", Some("tun_A".into()), None, None, TunnelMode::Http)
        .await
        .unwrap();
    let (mut client, _) = TestClient::connect(addr, "tun_A", false).await;

    // let two pings go unanswered so the recorded age grows
    for _ in 0..2 {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.recv_frame())
            .await
            .expect("no ping before deadline")
            .unwrap();
        assert!(matches!(frame, Frame::Ping));
    }
    let session = state.registry.by_token("tun_A").unwrap();
    assert!(session.heartbeat_age() >= Duration::from_secs(1));

    client.send(Frame::Pong).await;
    wait_until(|| session.heartbeat_age() < Duration::from_secs(1)).await;
}
