//! Console web server for the mempool service.
//!
//! The console exposes address/UTXO data from a Bitcoin node behind a
//! per-client rate limiter. [`Server`] owns the listener and coordinates the
//! tasks that make up a running console: the HTTP accept loop, the rate
//! limiter's sweep loop and a shutdown watcher. Cancelling the token handed
//! to [`Server::run`] stops all three.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod rpc;
pub mod state;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::http::{header, HeaderValue, Method, Request};
use axum::routing::get;
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use mempool_common::{ConsoleConfig, MempoolError, MempoolResult, ServerConfig};
use mempool_rate_limit::RateLimiter;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, info, warn};

pub use error::ApiError;
pub use rpc::{BitcoinRpc, HttpBitcoinRpc};
pub use state::{AppState, ConsoleMetrics, SharedState};

/// Build the console router with all routes and middleware.
///
/// Every route sits behind the rate limiter; CORS wraps everything so
/// preflight requests are answered without consuming a client's budget.
pub fn build_router(state: SharedState, config: &ConsoleConfig) -> MempoolResult<Router> {
    let cors = if config.cors.allowed_for_all_origins {
        CorsLayer::permissive()
    } else {
        let origins = config
            .cors
            .allowed_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin).map_err(|_| {
                    MempoolError::Config(format!("invalid allowed origin '{}'", origin))
                })
            })
            .collect::<MempoolResult<Vec<_>>>()?;

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_credentials(true)
            .allow_methods([
                Method::GET,
                Method::DELETE,
                Method::POST,
                Method::PATCH,
                Method::OPTIONS,
                Method::PUT,
            ])
    };

    let router = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/metrics", get(routes::metrics::get_metrics))
        .route(
            "/api/v1/address/{address}/utxo",
            get(routes::utxo::get_utxos),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit,
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("same-origin"),
        ))
        .layer(cors)
        .with_state(state);

    Ok(router)
}

/// Where the accept loop gets its listener from.
enum Listen {
    Bound(TcpListener),
    /// Bound lazily when the server starts running.
    Address(String),
}

/// Console web server and the lifecycle of its background tasks.
pub struct Server {
    shutdown_timeout: Duration,
    router: Router,
    limiter: RateLimiter,
    listen: Mutex<Option<Listen>>,
    local_addr: Option<SocketAddr>,
    closed: CancellationToken,
}

impl Server {
    /// Create a server that serves `router` on an already bound `listener`.
    pub fn new(
        config: &ServerConfig,
        listener: TcpListener,
        router: Router,
        limiter: RateLimiter,
    ) -> Self {
        let local_addr = listener.local_addr().ok();
        Self::with_listen(config, Listen::Bound(listener), local_addr, router, limiter)
    }

    /// Create a server that binds `config.listen` itself once [`Server::run`]
    /// starts. A bind failure is then reported by `run`.
    pub fn with_address(config: &ServerConfig, router: Router, limiter: RateLimiter) -> Self {
        let listen = Listen::Address(config.listen.clone());
        Self::with_listen(config, listen, None, router, limiter)
    }

    fn with_listen(
        config: &ServerConfig,
        listen: Listen,
        local_addr: Option<SocketAddr>,
        router: Router,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            shutdown_timeout: config.shutdown_timeout(),
            router,
            limiter,
            listen: Mutex::new(Some(listen)),
            local_addr,
            closed: CancellationToken::new(),
        }
    }

    /// Address of the bound listener, if the server was created with one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Serve requests and sweep the rate limiter until `token` is cancelled,
    /// the server is closed, or serving fails.
    ///
    /// Cancelling `token` stops new connections from being accepted and
    /// gives in-flight requests up to the configured shutdown timeout before
    /// the server is closed. Routine shutdown is reported as `Ok(())`; any
    /// other serving error stops the remaining tasks and is returned once
    /// they have all exited. Only the first such error is reported.
    ///
    /// A server runs once: the listener is consumed by the first call, and a
    /// later call fails with [`MempoolError::AlreadyStarted`].
    pub async fn run(&self, token: CancellationToken) -> MempoolResult<()> {
        let ctx = token.child_token();
        let served = CancellationToken::new();
        let listen = self.take_listen();
        let mut tasks: JoinSet<MempoolResult<()>> = JoinSet::new();

        // Shutdown watcher.
        {
            let ctx = ctx.clone();
            let served = served.clone();
            let closed = self.closed.clone();
            let timeout = self.shutdown_timeout;
            tasks.spawn(async move {
                ctx.cancelled().await;
                debug!("console shutdown requested");

                tokio::select! {
                    _ = served.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        warn!(
                            timeout_secs = timeout.as_secs(),
                            "graceful shutdown timed out, closing console server"
                        );
                        closed.cancel();
                    }
                }
                Ok(())
            });
        }

        // Rate limiter sweep loop.
        {
            let ctx = ctx.clone();
            let limiter = self.limiter.clone();
            tasks.spawn(async move {
                limiter.run(ctx).await;
                Ok(())
            });
        }

        // Accept loop.
        {
            let ctx = ctx.clone();
            let closed = self.closed.clone();
            let router = self.router.clone();
            tasks.spawn(async move {
                let _cancel_siblings = ctx.clone().drop_guard();
                let _mark_served = served.drop_guard();

                match serve(listen, router, ctx, closed).await {
                    Err(err) if err.is_shutdown() => Ok(()),
                    other => other,
                }
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result =
                joined.unwrap_or_else(|e| Err(MempoolError::TaskFailed(e.to_string())));

            if let Err(err) = result {
                ctx.cancel();
                match first_error {
                    None => first_error = Some(err),
                    Some(_) => debug!(error = %err, "discarding subsequent console error"),
                }
            }
        }

        info!("console server stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close the server immediately. Open connections are dropped along
    /// with their in-flight requests.
    ///
    /// Safe to call more than once and before or after [`Server::run`]; a
    /// server that was closed before running returns from `run` at once.
    pub fn close(&self) -> MempoolResult<()> {
        self.closed.cancel();
        drop(self.take_listen());
        Ok(())
    }

    fn take_listen(&self) -> Option<Listen> {
        self.listen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

async fn serve(
    listen: Option<Listen>,
    router: Router,
    ctx: CancellationToken,
    closed: CancellationToken,
) -> MempoolResult<()> {
    if closed.is_cancelled() {
        return Err(MempoolError::ServerClosed);
    }

    let listen = listen.ok_or(MempoolError::AlreadyStarted)?;
    if ctx.is_cancelled() {
        return Err(MempoolError::Cancelled);
    }

    let listener = match listen {
        Listen::Bound(listener) => listener,
        Listen::Address(addr) => TcpListener::bind(&addr)
            .await
            .map_err(|source| MempoolError::Bind { addr, source })?,
    };

    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "console web server listening");
    }

    let mut connections: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => {
                connections.shutdown().await;
                return Err(MempoolError::ServerClosed);
            }
            _ = ctx.cancelled() => break,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "console connection task failed");
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) if is_connection_error(&e) => {
                        debug!(error = %e, "failed to accept connection");
                        continue;
                    }
                    Err(e) => {
                        connections.shutdown().await;
                        return Err(MempoolError::Serve(e));
                    }
                };
                connections.spawn(serve_connection(stream, peer, router.clone(), ctx.clone()));
            }
        }
    }

    debug!(
        connections = connections.len(),
        "console stopped accepting, draining connections"
    );
    drop(listener);

    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => {
                connections.shutdown().await;
                return Err(MempoolError::ServerClosed);
            }
            joined = connections.join_next() => match joined {
                Some(Err(e)) => warn!(error = %e, "console connection task failed"),
                Some(Ok(())) => {}
                None => return Ok(()),
            },
        }
    }
}

/// Serve one HTTP/1 connection. Once `ctx` is cancelled the connection
/// finishes its current request and closes.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    ctx: CancellationToken,
) {
    let service = router.map_request(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(service));
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = ctx.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "console connection error");
    }
}

/// Errors that concern a single connection rather than the listener.
fn is_connection_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}
