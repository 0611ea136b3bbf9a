use std::net::SocketAddr;
use std::sync::Arc;

use mempool_common::{AppConfig, MempoolError, MempoolResult};
use mempool_console::{build_router, AppState, BitcoinRpc, HttpBitcoinRpc, Server};
use mempool_rate_limit::RateLimiter;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A running mempool node: the console web server and everything it needs.
pub struct Peer {
    pub rpc: Arc<dyn BitcoinRpc>,
    console: Server,
}

impl Peer {
    /// Bind the console listener and wire up the rate limiter and the
    /// Bitcoin node client.
    pub async fn new(config: AppConfig) -> MempoolResult<Self> {
        let rpc: Arc<dyn BitcoinRpc> = Arc::new(HttpBitcoinRpc::new(&config.bitcoin.rpc_url)?);
        Self::with_rpc(config, rpc).await
    }

    pub async fn with_rpc(config: AppConfig, rpc: Arc<dyn BitcoinRpc>) -> MempoolResult<Self> {
        let listen = config.server.listen.clone();
        let listener = TcpListener::bind(&listen)
            .await
            .map_err(|source| MempoolError::Bind {
                addr: listen,
                source,
            })?;

        let limiter = RateLimiter::new(&config.rate_limiter)?;
        let state = Arc::new(AppState::new(limiter.clone(), Arc::clone(&rpc))?);
        let router = build_router(state, &config.console)?;
        let console = Server::new(&config.server, listener, router, limiter);

        Ok(Self { rpc, console })
    }

    pub fn console_addr(&self) -> Option<SocketAddr> {
        self.console.local_addr()
    }

    /// Run the console until `token` is cancelled or it fails.
    pub async fn run(&self, token: CancellationToken) -> MempoolResult<()> {
        debug!("mempool running");
        if let Some(addr) = self.console_addr() {
            info!(addr = %addr, "console listening");
        }
        self.console.run(token).await
    }

    /// Close all resources.
    pub fn close(&self) -> MempoolResult<()> {
        debug!("mempool closing");
        self.console.close().map_err(|e| {
            error!(error = %e, "could not close mempool");
            e
        })
    }
}
