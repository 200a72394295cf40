//! Tunnel record and request-log persistence over sqlx/SQLite.

use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tunnels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL UNIQUE,
    token TEXT NOT NULL UNIQUE,
    mode TEXT NOT NULL DEFAULT 'http',
    enabled INTEGER NOT NULL DEFAULT 1,
    name TEXT,
    description TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT,
    last_connected_at TEXT,
    total_requests INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tunnels_domain ON tunnels(domain);
CREATE INDEX IF NOT EXISTS idx_tunnels_token ON tunnels(token);

CREATE TABLE IF NOT EXISTS tunnel_request_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    tunnel_domain TEXT NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    request_headers TEXT,
    request_body TEXT,
    status_code INTEGER,
    response_headers TEXT,
    response_body TEXT,
    error TEXT,
    duration_ms INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tunnel_request_logs_timestamp ON tunnel_request_logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_tunnel_request_logs_domain ON tunnel_request_logs(tunnel_domain);
CREATE INDEX IF NOT EXISTS idx_tunnel_request_logs_status ON tunnel_request_logs(status_code);
"#;

/// Transport mode of a tunnel. Immutable after create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    Http,
    Tcp,
}

impl TunnelMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Self::Http),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelRecord {
    pub id: i64,
    pub domain: String,
    pub token: String,
    pub mode: TunnelMode,
    pub enabled: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub total_requests: i64,
}

#[derive(Debug, Clone, Default)]
pub struct TunnelFlags {
    pub enabled: Option<bool>,
    pub name: Option<String>,
    pub description: Option<String>,
}

/// One forwarded request, as persisted. Envelope fields are truncated on
/// write (path 1000, bodies 10000, error 2000 chars).
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub tunnel_domain: String,
    pub method: String,
    pub path: String,
    pub request_headers: Option<String>,
    pub request_body: Option<String>,
    pub status_code: Option<i64>,
    pub response_headers: Option<String>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewRequestLog {
    pub tunnel_domain: String,
    pub method: String,
    pub path: String,
    pub request_headers: Option<String>,
    pub request_body: Option<String>,
    pub status_code: Option<i64>,
    pub response_headers: Option<String>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

/// Generate a fresh connection token: `tun_` + 32 random bytes, URL-safe.
pub fn generate_token() -> String {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("tun_{}", URL_SAFE_NO_PAD.encode(raw))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    // back off to a char boundary
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) and bootstrap the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // In-memory SQLite gives every pooled connection its own database;
        // a single connection keeps the schema visible.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn create_tunnel(
        &self,
        domain: &str,
        token: Option<String>,
        name: Option<String>,
        description: Option<String>,
        mode: TunnelMode,
    ) -> Result<TunnelRecord, StoreError> {
        let token = token.unwrap_or_else(generate_token);
        let result = sqlx::query(
            r#"INSERT INTO tunnels (domain, token, mode, enabled, name, description, created_at, total_requests)
               VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, 0)"#,
        )
        .bind(domain)
        .bind(&token)
        .bind(mode.as_str())
        .bind(&name)
        .bind(&description)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.tunnel_by_domain(domain).await,
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateDomain),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn tunnel_by_domain(&self, domain: &str) -> Result<TunnelRecord, StoreError> {
        sqlx::query("SELECT * FROM tunnels WHERE domain = ?1")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| tunnel_from_row(&row))
            .ok_or(StoreError::NotFound)
    }

    pub async fn tunnel_by_token(&self, token: &str) -> Result<TunnelRecord, StoreError> {
        sqlx::query("SELECT * FROM tunnels WHERE token = ?1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| tunnel_from_row(&row))
            .ok_or(StoreError::NotFound)
    }

    pub async fn list_tunnels(
        &self,
        enabled_only: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TunnelRecord>, StoreError> {
        let query = if enabled_only {
            "SELECT * FROM tunnels WHERE enabled = 1 ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
        } else {
            "SELECT * FROM tunnels ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
        };
        let rows = sqlx::query(query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(tunnel_from_row).collect())
    }

    /// Update the mutable flags of a record; absent fields are left as-is.
    pub async fn update_tunnel_flags(
        &self,
        domain: &str,
        flags: TunnelFlags,
    ) -> Result<TunnelRecord, StoreError> {
        let result = sqlx::query(
            r#"UPDATE tunnels SET
                   enabled = COALESCE(?1, enabled),
                   name = COALESCE(?2, name),
                   description = COALESCE(?3, description),
                   updated_at = ?4
               WHERE domain = ?5"#,
        )
        .bind(flags.enabled)
        .bind(&flags.name)
        .bind(&flags.description)
        .bind(Utc::now())
        .bind(domain)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        self.tunnel_by_domain(domain).await
    }

    pub async fn delete_tunnel(&self, domain: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM tunnels WHERE domain = ?1")
            .bind(domain)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn regenerate_token(&self, domain: &str) -> Result<String, StoreError> {
        let token = generate_token();
        let result = sqlx::query(
            "UPDATE tunnels SET token = ?1, updated_at = ?2 WHERE domain = ?3",
        )
        .bind(&token)
        .bind(Utc::now())
        .bind(domain)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(token)
    }

    pub async fn touch_last_connected(&self, token: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE tunnels SET last_connected_at = ?1 WHERE token = ?2")
            .bind(Utc::now())
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn increment_requests(&self, token: &str, n: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tunnels SET total_requests = total_requests + ?1 WHERE token = ?2",
        )
        .bind(n)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn append_request_log(&self, log: NewRequestLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO tunnel_request_logs
                   (timestamp, tunnel_domain, method, path, request_headers, request_body,
                    status_code, response_headers, response_body, error, duration_ms)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
        )
        .bind(Utc::now())
        .bind(&log.tunnel_domain)
        .bind(&log.method)
        .bind(truncate(&log.path, 1000))
        .bind(&log.request_headers)
        .bind(log.request_body.as_deref().map(|s| truncate(s, 10_000).to_string()))
        .bind(log.status_code)
        .bind(&log.response_headers)
        .bind(log.response_body.as_deref().map(|s| truncate(s, 10_000).to_string()))
        .bind(log.error.as_deref().map(|s| truncate(s, 2000).to_string()))
        .bind(log.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_request_logs(
        &self,
        domain: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RequestLog>, StoreError> {
        let rows = match domain {
            Some(d) => {
                sqlx::query(
                    r#"SELECT * FROM tunnel_request_logs WHERE tunnel_domain = ?1
                       ORDER BY timestamp DESC LIMIT ?2 OFFSET ?3"#,
                )
                .bind(d)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM tunnel_request_logs ORDER BY timestamp DESC LIMIT ?1 OFFSET ?2",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(log_from_row).collect())
    }

    pub async fn count_request_logs(&self, domain: Option<&str>) -> Result<i64, StoreError> {
        let count: i64 = match domain {
            Some(d) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM tunnel_request_logs WHERE tunnel_domain = ?1",
                )
                .bind(d)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM tunnel_request_logs")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn tunnel_from_row(row: &SqliteRow) -> TunnelRecord {
    TunnelRecord {
        id: row.get("id"),
        domain: row.get("domain"),
        token: row.get("token"),
        mode: TunnelMode::parse(row.get("mode")).unwrap_or(TunnelMode::Http),
        enabled: row.get("enabled"),
        name: row.get("name"),
        description: row.get("description"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_connected_at: row.get("last_connected_at"),
        total_requests: row.get("total_requests"),
    }
}

fn log_from_row(row: &SqliteRow) -> RequestLog {
    RequestLog {
        id: row.get("id"),
        timestamp: row.get("timestamp"),
        tunnel_domain: row.get("tunnel_domain"),
        method: row.get("method"),
        path: row.get("path"),
        request_headers: row.get("request_headers"),
        request_body: row.get("request_body"),
        status_code: row.get("status_code"),
        response_headers: row.get("response_headers"),
        response_body: row.get("response_body"),
        error: row.get("error"),
        duration_ms: row.get("duration_ms"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:").await.unwrap()
    }

    #[test]
    fn token_format() {
        let token = generate_token();
        assert!(token.starts_with("tun_"));
        assert!(token.len() > 36);
        assert_ne!(token, generate_token());
    }

    #[tokio::test]
    async fn create_and_lookup() {
        let store = memory_store().await;
        let record = store
            .create_tunnel("demo", None, Some("Demo".into()), None, TunnelMode::Http)
            .await
            .unwrap();
        assert_eq!(record.domain, "demo");
        assert!(record.enabled);
        assert!(record.token.starts_with("tun_"));
        assert_eq!(record.total_requests, 0);

        let by_domain = store.tunnel_by_domain("demo").await.unwrap();
        let by_token = store.tunnel_by_token(&record.token).await.unwrap();
        assert_eq!(by_domain.id, by_token.id);
    }

    #[tokio::test]
    async fn duplicate_domain_rejected() {
        let store = memory_store().await;
        store
            .create_tunnel("demo", None, None, None, TunnelMode::Http)
            .await
            .unwrap();
        let err = store
            .create_tunnel("demo", None, None, None, TunnelMode::Http)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDomain));
    }

    #[tokio::test]
    async fn create_then_delete_restores_prior_state() {
        let store = memory_store().await;
        store
            .create_tunnel("demo", None, None, None, TunnelMode::Tcp)
            .await
            .unwrap();
        store.delete_tunnel("demo").await.unwrap();

        assert!(matches!(
            store.tunnel_by_domain("demo").await.unwrap_err(),
            StoreError::NotFound
        ));
        assert!(matches!(
            store.delete_tunnel("demo").await.unwrap_err(),
            StoreError::NotFound
        ));
        // the domain is creatable again
        store
            .create_tunnel("demo", None, None, None, TunnelMode::Http)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn regenerate_token_rotates() {
        let store = memory_store().await;
        let record = store
            .create_tunnel("demo", None, None, None, TunnelMode::Http)
            .await
            .unwrap();
        let new_token = store.regenerate_token("demo").await.unwrap();
        assert_ne!(new_token, record.token);
        assert!(store.tunnel_by_token(&record.token).await.is_err());
        assert_eq!(store.tunnel_by_token(&new_token).await.unwrap().domain, "demo");
    }

    #[tokio::test]
    async fn flags_and_counters() {
        let store = memory_store().await;
        let record = store
            .create_tunnel("demo", None, None, None, TunnelMode::Http)
            .await
            .unwrap();

        let updated = store
            .update_tunnel_flags(
                "demo",
                TunnelFlags {
                    enabled: Some(false),
                    name: Some("renamed".into()),
                    description: None,
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.name.as_deref(), Some("renamed"));
        assert!(updated.updated_at.is_some());

        assert!(store.increment_requests(&record.token, 3).await.unwrap());
        assert!(store.touch_last_connected(&record.token).await.unwrap());
        let fresh = store.tunnel_by_domain("demo").await.unwrap();
        assert_eq!(fresh.total_requests, 3);
        assert!(fresh.last_connected_at.is_some());

        let enabled_only = store.list_tunnels(true, 100, 0).await.unwrap();
        assert!(enabled_only.is_empty());
        let all = store.list_tunnels(false, 100, 0).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn request_logs_roundtrip_with_truncation() {
        let store = memory_store().await;
        let long_body = "x".repeat(20_000);
        store
            .append_request_log(NewRequestLog {
                tunnel_domain: "demo".into(),
                method: "POST".into(),
                path: "/api/echo".into(),
                request_body: Some(long_body.clone()),
                response_body: Some(long_body),
                status_code: Some(200),
                duration_ms: 42,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(store.count_request_logs(Some("demo")).await.unwrap(), 1);
        assert_eq!(store.count_request_logs(Some("other")).await.unwrap(), 0);

        let logs = store
            .recent_request_logs(Some("demo"), 10, 0)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].request_body.as_ref().unwrap().len(), 10_000);
        assert_eq!(logs[0].status_code, Some(200));
    }
}
