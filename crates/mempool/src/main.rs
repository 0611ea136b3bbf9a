mod peer;

use anyhow::Result;
use mempool_common::{process, AppConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::peer::Peer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    // Starting graceful exit on the first SIGINT/SIGTERM.
    let token = CancellationToken::new();
    let _signals = process::on_shutdown_signal({
        let token = token.clone();
        move || token.cancel()
    })?;

    // Parse command-line args for config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/mempool.yaml".to_string());

    info!(config_path = %config_path, "starting mempool");

    let config = AppConfig::load(&config_path).map_err(|e| {
        error!(error = %e, "could not load config");
        e
    })?;

    let peer = Peer::new(config).await.map_err(|e| {
        error!(error = %e, "could not initialize peer");
        e
    })?;

    match peer.rpc.ping().await {
        Ok(()) => info!("connected to bitcoin node"),
        Err(e) => warn!(error = %e, "bitcoin node is not reachable"),
    }

    let run = peer.run(token).await;
    let close = peer.close();

    match (run, close) {
        (Ok(()), Ok(())) => {
            info!("mempool stopped");
            Ok(())
        }
        (Err(run), Ok(())) => Err(run.into()),
        (Ok(()), Err(close)) => Err(close.into()),
        (Err(run), Err(close)) => Err(anyhow::anyhow!("{}; close also failed: {}", run, close)),
    }
}
