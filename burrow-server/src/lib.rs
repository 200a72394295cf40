//! Burrow tunnel server: WebSocket ingress for edge clients plus the public
//! HTTP surface that forwards traffic back through them.

pub mod api;
pub mod config;
pub mod error;
pub mod forward;
pub mod pending;
pub mod registry;
pub mod relay;
pub mod session;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::Config;
use crate::registry::TunnelRegistry;
use crate::relay::RelayMap;
use crate::store::Store;

/// Shared server state. One instance per server; nothing is process-global.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub registry: Arc<TunnelRegistry>,
    pub relays: Arc<RelayMap>,
}

impl AppState {
    pub fn new(config: Config, store: Store) -> Self {
        let heartbeat_timeout = Duration::from_secs(config.heartbeat_timeout);
        Self {
            config: Arc::new(config),
            store,
            registry: Arc::new(TunnelRegistry::new(heartbeat_timeout)),
            relays: Arc::new(RelayMap::new()),
        }
    }
}

pub fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Run the server until interrupted.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        domain = %config.domain,
        database = %config.database_url,
        "burrow-server starting"
    );

    let store = Store::connect(&config.database_url).await?;
    let state = AppState::new(config, store);

    if state.config.tcp_listen_port.is_some() {
        let config = Arc::clone(&state.config);
        let registry = Arc::clone(&state.registry);
        let relays = Arc::clone(&state.relays);
        tokio::spawn(async move {
            if let Err(e) = relay::run_listener(config, registry, relays).await {
                error!(error = %e, "tcp listener relay failed");
            }
        });
    }

    let router = api::build_router(state.clone());
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, ws_path = %state.config.ws_path, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("burrow-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
