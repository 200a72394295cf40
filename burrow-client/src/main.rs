mod config;
mod state;
mod tunnel;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use config::Config;
use state::ClientState;

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server_url,
        target = %config.target_url,
        "burrow-client starting"
    );

    let state = ClientState::new(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    tunnel::run(&state, shutdown_rx).await;
    Ok(())
}
