//! Management HTTP surface and the public subdomain ingress.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::error::StoreError;
use crate::forward::{forward_stream, forward_tcp_unary, forward_unary, ForwardOutcome};
use crate::pending::StreamEvent;
use crate::session;
use crate::store::{RequestLog, TunnelFlags, TunnelMode, TunnelRecord};
use crate::AppState;

/// Largest request body accepted on the public ingress.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/info", get(info))
        .route("/api/tunnels", post(create_tunnel).get(list_tunnels))
        .route("/api/tunnels/check-availability", get(check_availability))
        .route(
            "/api/tunnels/{domain}",
            get(get_tunnel).put(update_tunnel).delete(delete_tunnel),
        )
        .route(
            "/api/tunnels/{domain}/regenerate-token",
            post(regenerate_token),
        )
        .route("/api/tunnels/{domain}/forward", post(forward_endpoint))
        .route("/api/tunnels/{domain}/logs", get(tunnel_logs))
        .route(&state.config.ws_path, get(session::ws_handler))
        .fallback(catch_all)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── error plumbing ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, detail)
    }

    fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::new(StatusCode::NOT_FOUND, "tunnel not found"),
            StoreError::DuplicateDomain => {
                Self::new(StatusCode::CONFLICT, "domain already exists")
            }
            StoreError::Database(e) => {
                error!(error = %e, "store operation failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "database error")
            }
        }
    }
}

// ── auth ────────────────────────────────────────────────────────────────────

fn api_key_matches(state: &AppState, headers: &HeaderMap) -> bool {
    match &state.config.admin_api_key {
        Some(key) => headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|presented| presented == key),
        None => false,
    }
}

/// Admin endpoints: open unless an API key is configured.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.config.admin_api_key.is_none() || api_key_matches(state, headers) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("invalid api key"))
    }
}

/// Tunnel creation: open unless a JWT secret is configured; then a valid
/// Bearer HS256 token (or the admin API key) is required.
fn authorize_create(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(secret) = &state.config.jwt_secret else {
        return Ok(());
    };
    if api_key_matches(state, headers) {
        return Ok(());
    }
    verify_bearer(secret, headers.get(header::AUTHORIZATION))
}

fn verify_bearer(secret: &str, header: Option<&HeaderValue>) -> Result<(), ApiError> {
    let value = header
        .and_then(|h| h.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Authorization header required"))?;
    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| ApiError::unauthorized("Invalid authorization format"))?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(ApiError::unauthorized("Invalid authorization format"));
    }

    let mut validation = Validation::new(Algorithm::HS256);
    // exp is validated when present; tokens without one are accepted
    validation.required_spec_claims.clear();
    match decode::<Value>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(_) => Ok(()),
        Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => {
            Err(ApiError::unauthorized("Token expired"))
        }
        Err(_) => Err(ApiError::unauthorized("Invalid token")),
    }
}

// ── serialized shapes ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct TunnelInfo {
    id: i64,
    domain: String,
    name: Option<String>,
    description: Option<String>,
    mode: &'static str,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    last_connected_at: Option<DateTime<Utc>>,
    total_requests: i64,
    connected: bool,
}

impl TunnelInfo {
    fn from_record(record: TunnelRecord, connected: bool) -> Self {
        Self {
            id: record.id,
            domain: record.domain,
            name: record.name,
            description: record.description,
            mode: record.mode.as_str(),
            enabled: record.enabled,
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_connected_at: record.last_connected_at,
            total_requests: record.total_requests,
            connected,
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestLogItem {
    id: i64,
    timestamp: DateTime<Utc>,
    tunnel_domain: String,
    method: String,
    path: String,
    request_headers: Value,
    request_body: Option<String>,
    status_code: Option<i64>,
    response_headers: Value,
    response_body: Option<String>,
    error: Option<String>,
    duration_ms: i64,
}

impl RequestLogItem {
    fn from_log(log: RequestLog) -> Self {
        let parse = |s: Option<String>| {
            s.and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(Value::Null)
        };
        // bodies are stored at full length but returned abbreviated
        let clip = |s: Option<String>| s.map(|s| s.chars().take(500).collect::<String>());
        Self {
            id: log.id,
            timestamp: log.timestamp,
            tunnel_domain: log.tunnel_domain,
            method: log.method,
            path: log.path,
            request_headers: parse(log.request_headers),
            request_body: clip(log.request_body),
            status_code: log.status_code,
            response_headers: parse(log.response_headers),
            response_body: clip(log.response_body),
            error: log.error,
            duration_ms: log.duration_ms,
        }
    }
}

fn is_valid_domain(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes[0].is_ascii_alphanumeric()
        && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

// ── management endpoints ────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "connected_tunnels": state.registry.len(),
    }))
}

async fn info(State(state): State<AppState>) -> Json<Value> {
    let config = &state.config;
    let ws_url = config
        .ws_url
        .clone()
        .unwrap_or_else(|| format!("ws://{}{}", config.domain, config.ws_path));
    Json(json!({
        "name": "burrow-server",
        "version": env!("CARGO_PKG_VERSION"),
        "domain": format!("{{subdomain}}.{}", config.domain),
        "ws_url": ws_url,
        "auth_required": config.jwt_secret.is_some(),
        "instruction": config.instruction,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateTunnelBody {
    domain: String,
    name: Option<String>,
    description: Option<String>,
    token: Option<String>,
    mode: Option<String>,
}

async fn create_tunnel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTunnelBody>,
) -> Result<Json<Value>, ApiError> {
    authorize_create(&state, &headers)?;
    if !is_valid_domain(&body.domain) {
        return Err(ApiError::bad_request("invalid domain format"));
    }
    let mode = match body.mode.as_deref() {
        None => TunnelMode::Http,
        Some(raw) => {
            TunnelMode::parse(raw).ok_or_else(|| ApiError::bad_request("invalid mode"))?
        }
    };
    let record = state
        .store
        .create_tunnel(&body.domain, body.token, body.name, body.description, mode)
        .await?;
    Ok(Json(json!({
        "domain": record.domain,
        "token": record.token,
        "name": record.name,
    })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    enabled_only: bool,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_tunnels(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TunnelInfo>>, ApiError> {
    let records = state
        .store
        .list_tunnels(
            query.enabled_only,
            query.limit.unwrap_or(100),
            query.offset.unwrap_or(0),
        )
        .await?;
    let infos = records
        .into_iter()
        .map(|record| {
            let connected = state.registry.is_connected(&record.domain);
            TunnelInfo::from_record(record, connected)
        })
        .collect();
    Ok(Json(infos))
}

#[derive(Debug, Deserialize)]
struct AvailabilityQuery {
    name: String,
}

async fn check_availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<Value>, ApiError> {
    if !is_valid_domain(&query.name) {
        return Ok(Json(json!({
            "available": false,
            "name": query.name,
            "reason": "invalid domain format",
        })));
    }
    match state.store.tunnel_by_domain(&query.name).await {
        Ok(_) => Ok(Json(json!({
            "available": false,
            "name": query.name,
            "reason": "exists",
        }))),
        Err(StoreError::NotFound) => Ok(Json(json!({
            "available": true,
            "name": query.name,
        }))),
        Err(e) => Err(e.into()),
    }
}

async fn get_tunnel(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TunnelInfo>, ApiError> {
    require_admin(&state, &headers)?;
    let record = state.store.tunnel_by_domain(&domain).await?;
    let connected = state.registry.is_connected(&domain);
    Ok(Json(TunnelInfo::from_record(record, connected)))
}

#[derive(Debug, Deserialize)]
struct UpdateTunnelBody {
    enabled: Option<bool>,
    name: Option<String>,
    description: Option<String>,
}

async fn update_tunnel(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateTunnelBody>,
) -> Result<Json<TunnelInfo>, ApiError> {
    require_admin(&state, &headers)?;
    let record = state
        .store
        .update_tunnel_flags(
            &domain,
            TunnelFlags {
                enabled: body.enabled,
                name: body.name,
                description: body.description,
            },
        )
        .await?;
    let connected = state.registry.is_connected(&domain);
    Ok(Json(TunnelInfo::from_record(record, connected)))
}

/// Deletion is authorized by the admin key, or by presenting the tunnel's
/// own token in `X-Tunnel-Token`.
async fn delete_tunnel(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.tunnel_by_domain(&domain).await?;
    let own_token = headers
        .get("x-tunnel-token")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| presented == record.token);
    if !own_token {
        require_admin(&state, &headers)
            .map_err(|_| ApiError::forbidden("admin key or tunnel token required"))?;
    }
    state.store.delete_tunnel(&domain).await?;
    if let Some(session) = state.registry.unregister(&record.token) {
        session.request_close(crate::registry::CloseReason::Replaced);
    }
    Ok(Json(json!({ "deleted": true, "domain": domain })))
}

async fn regenerate_token(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let token = state.store.regenerate_token(&domain).await?;
    Ok(Json(json!({ "domain": domain, "token": token })))
}

#[derive(Debug, Deserialize)]
struct ForwardBody {
    method: Option<String>,
    path: Option<String>,
    headers: Option<HashMap<String, String>>,
    body: Option<Value>,
    timeout: Option<u64>,
}

async fn forward_endpoint(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(body): Json<ForwardBody>,
) -> Result<Json<ForwardOutcome>, ApiError> {
    let record = state.store.tunnel_by_domain(&domain).await?;
    let timeout = body.timeout.unwrap_or(state.config.default_timeout);
    let payload = body.body.map(|v| match v {
        Value::String(s) => s,
        other => other.to_string(),
    });

    let outcome = match record.mode {
        TunnelMode::Http => {
            forward_unary(
                &state,
                &domain,
                body.method.as_deref().unwrap_or("GET"),
                body.path.as_deref().unwrap_or("/"),
                body.headers.unwrap_or_default(),
                payload,
                timeout,
            )
            .await
        }
        TunnelMode::Tcp => forward_tcp_unary(&state, &domain, payload, timeout).await,
    };
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn tunnel_logs(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);
    let logs = state
        .store
        .recent_request_logs(Some(&domain), limit, offset)
        .await?;
    let total = state.store.count_request_logs(Some(&domain)).await?;
    let items: Vec<RequestLogItem> = logs.into_iter().map(RequestLogItem::from_log).collect();
    Ok(Json(json!({ "logs": items, "total": total })))
}

// ── public ingress: subdomain routing ───────────────────────────────────────

fn extract_subdomain(host: &str, base: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    if host == base {
        return None;
    }
    let sub = host.strip_suffix(base)?.strip_suffix('.')?;
    // only one label deep
    if sub.is_empty() || sub.contains('.') {
        return None;
    }
    Some(sub.to_string())
}

async fn catch_all(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let Some(subdomain) = extract_subdomain(host, &state.config.domain) else {
        if parts.uri.path() == "/" {
            return Json(json!({
                "service": "burrow-server",
                "version": env!("CARGO_PKG_VERSION"),
                "domain": state.config.domain,
                "status": "running",
            }))
            .into_response();
        }
        return (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not Found" }))).into_response();
    };

    if !state.registry.is_connected(&subdomain) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": format!("tunnel not connected: {subdomain}") })),
        )
            .into_response();
    }

    let record = match state.store.tunnel_by_domain(&subdomain).await {
        Ok(record) => record,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let method = parts.method.to_string();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut fwd_headers = HashMap::new();
    let mut wants_sse = false;
    for (name, value) in &parts.headers {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        if let Ok(value) = value.to_str() {
            if name == header::ACCEPT && value.contains("text/event-stream") {
                wants_sse = true;
            }
            fwd_headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) if bytes.is_empty() => None,
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": "unreadable body" })),
            )
                .into_response()
        }
    };

    let timeout = state.config.default_timeout;
    match record.mode {
        TunnelMode::Tcp => {
            let outcome = forward_tcp_unary(&state, &subdomain, body, timeout).await;
            outcome_response(outcome)
        }
        TunnelMode::Http if wants_sse => {
            match forward_stream(&state, &subdomain, &method, &path, fwd_headers, body, timeout)
                .await
            {
                Ok(stream) => sse_response(stream),
                Err(outcome) => outcome_response(outcome),
            }
        }
        TunnelMode::Http => {
            let outcome =
                forward_unary(&state, &subdomain, &method, &path, fwd_headers, body, timeout)
                    .await;
            outcome_response(outcome)
        }
    }
}

fn outcome_response(outcome: ForwardOutcome) -> Response {
    let status =
        StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let (content_type, body) = if outcome.body == Value::Null {
        match &outcome.error {
            Some(err) => (
                "application/json".to_string(),
                json!({ "error": err }).to_string(),
            ),
            None => ("application/json".to_string(), String::new()),
        }
    } else {
        let content_type = outcome
            .headers
            .get("content-type")
            .cloned()
            .unwrap_or_else(|| "application/json".to_string());
        (content_type, outcome.body_text())
    };

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type);
    if let Some(headers) = response.headers_mut() {
        for (name, value) in &outcome.headers {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("content-type")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(name, value);
            }
        }
    }
    response
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Relay a tunnel stream out as an SSE body. Chunks pass through verbatim;
/// a stream error surfaces as a terminal `event: error`.
fn sse_response(mut stream: crate::forward::TunnelStream) -> Response {
    let body_stream = async_stream::stream! {
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Start { .. } => {}
                StreamEvent::Chunk { data, .. } => {
                    yield Ok::<Bytes, Infallible>(Bytes::from(data));
                }
                StreamEvent::End { error, .. } => {
                    if let Some(err) = error {
                        yield Ok(Bytes::from(format!("event: error\ndata: {err}\n\n")));
                    }
                    break;
                }
            }
        }
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(HeaderName::from_static("x-accel-buffering"), "no")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
