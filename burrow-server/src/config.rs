use clap::Parser;

/// Burrow tunnel server.
///
/// Accepts persistent WebSocket connections from edge clients and multiplexes
/// public HTTP/TCP traffic back through them to the clients' local services.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address to bind the HTTP/WebSocket listener on
    #[arg(long, env = "BURROW_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the HTTP/WebSocket listener
    #[arg(long, env = "BURROW_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Base domain for subdomain routing (e.g. tunnels.example.com)
    #[arg(long, env = "BURROW_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// Database connection URL for the tunnel store
    #[arg(long, env = "BURROW_DATABASE_URL", default_value = "sqlite://tunnels.db")]
    pub database_url: String,

    /// WebSocket endpoint path for tunnel clients
    #[arg(long, env = "BURROW_WS_PATH", default_value = "/ws/tunnel")]
    pub ws_path: String,

    /// Full WebSocket URL advertised in /api/info (overrides the derived one)
    #[arg(long, env = "BURROW_WS_URL")]
    pub ws_url: Option<String>,

    /// Heartbeat ping interval in seconds
    #[arg(long, env = "BURROW_HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub heartbeat_interval: u64,

    /// Seconds without a pong before a session is considered stale
    #[arg(long, env = "BURROW_HEARTBEAT_TIMEOUT", default_value_t = 90)]
    pub heartbeat_timeout: u64,

    /// Default forward timeout in seconds
    #[arg(long, env = "BURROW_DEFAULT_TIMEOUT", default_value_t = 300)]
    pub default_timeout: u64,

    /// Maximum in-flight pending requests per session
    #[arg(long, env = "BURROW_MAX_PENDING_REQUESTS", default_value_t = 1000)]
    pub max_pending_requests: usize,

    /// API key for the tunnel management endpoints
    #[arg(long, env = "BURROW_ADMIN_API_KEY")]
    pub admin_api_key: Option<String>,

    /// HS256 secret; when set, tunnel creation requires a Bearer JWT
    #[arg(long, env = "BURROW_JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Free-form onboarding text returned by /api/info
    #[arg(long, env = "BURROW_INSTRUCTION")]
    pub instruction: Option<String>,

    /// Bind address for the raw TCP listener relay
    #[arg(long, env = "BURROW_TCP_LISTEN_HOST", default_value = "0.0.0.0")]
    pub tcp_listen_host: String,

    /// Port for the raw TCP listener relay (disabled when absent)
    #[arg(long, env = "BURROW_TCP_LISTEN_PORT")]
    pub tcp_listen_port: Option<u16>,

    /// Tunnel domain the TCP listener relays to (first connected when absent)
    #[arg(long, env = "BURROW_TCP_TARGET_DOMAIN")]
    pub tcp_target_domain: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BURROW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "BURROW_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}
