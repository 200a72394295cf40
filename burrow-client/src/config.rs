use clap::Parser;

/// Burrow tunnel client.
///
/// Opens a persistent outbound WebSocket to the tunnel server and executes
/// the requests it relays against a local target service.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Server WebSocket URL (e.g. wss://tunnels.example.com/ws/tunnel)
    #[arg(
        long,
        env = "BURROW_CLIENT_SERVER_URL",
        default_value = "ws://localhost:8000/ws/tunnel"
    )]
    pub server_url: String,

    /// Tunnel token (tun_xxx)
    #[arg(long, env = "BURROW_CLIENT_TOKEN")]
    pub token: String,

    /// Local target service URL
    #[arg(
        long,
        env = "BURROW_CLIENT_TARGET_URL",
        default_value = "http://localhost:8080"
    )]
    pub target_url: String,

    /// Seconds to wait between reconnect attempts
    #[arg(long, env = "BURROW_CLIENT_RECONNECT_INTERVAL", default_value_t = 5)]
    pub reconnect_interval: u64,

    /// Maximum consecutive failed reconnects before giving up (0 = infinite)
    #[arg(long, env = "BURROW_CLIENT_MAX_RECONNECT_ATTEMPTS", default_value_t = 0)]
    pub max_reconnect_attempts: u32,

    /// Take over an existing session holding the same token
    #[arg(long, env = "BURROW_CLIENT_FORCE", default_value_t = false)]
    pub force: bool,

    /// Upper bound on the per-request timeout towards the target, in seconds
    #[arg(long, env = "BURROW_CLIENT_REQUEST_TIMEOUT", default_value_t = 300)]
    pub request_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BURROW_CLIENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "BURROW_CLIENT_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}
