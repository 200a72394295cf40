//! Shared client state passed to the tunnel subsystems.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

/// Built once at startup and shared across reconnects.
pub struct ClientState {
    pub config: Arc<Config>,
    /// HTTP client towards the local target (timeouts applied per request).
    pub http: reqwest::Client,
    /// Target host/port for raw TCP legs, parsed from `target_url`.
    pub target_host: String,
    pub target_port: u16,
}

impl ClientState {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let url = url::Url::parse(&config.target_url)?;
        let target_host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("missing host in target URL"))?
            .to_string();
        let target_port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("cannot determine target port"))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build http client: {e}"))?;

        Ok(Arc::new(Self {
            config: Arc::new(config),
            http,
            target_host,
            target_port,
        }))
    }
}
