pub mod client;
pub mod dispatcher;
pub mod executor;
pub mod tcp;
pub mod writer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::state::ClientState;

/// Run the tunnel main loop: connect, dispatch, reconnect until shutdown or
/// the attempt cap is hit.
pub async fn run(state: &Arc<ClientState>, mut shutdown: watch::Receiver<bool>) {
    let mut failed_attempts: u32 = 0;

    loop {
        match client::connect_and_run(state, &mut shutdown).await {
            Ok(client::TunnelOutcome::Shutdown) => {
                info!("tunnel shut down gracefully");
                return;
            }
            Ok(client::TunnelOutcome::Disconnected) => {
                // the session authenticated, so the counter starts over
                failed_attempts = 0;
                info!("tunnel disconnected, will reconnect");
            }
            Err(e) => {
                failed_attempts += 1;
                error!(error = %e, attempt = failed_attempts, "tunnel connection failed");
            }
        }

        if *shutdown.borrow() {
            return;
        }
        let max = state.config.max_reconnect_attempts;
        if max > 0 && failed_attempts > max {
            error!(max, "max reconnect attempts exceeded, giving up");
            return;
        }

        let delay = Duration::from_secs(state.config.reconnect_interval);
        info!(delay_secs = delay.as_secs(), "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                info!("shutdown requested during reconnect wait");
                return;
            }
        }
    }
}
