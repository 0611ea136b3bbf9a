use std::sync::Arc;
use std::time::Instant;

use mempool_common::MempoolResult;
use mempool_rate_limit::RateLimiter;
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

use crate::rpc::BitcoinRpc;

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

/// State shared by the console middleware and handlers.
pub struct AppState {
    pub limiter: RateLimiter,
    pub rpc: Arc<dyn BitcoinRpc>,
    pub metrics: ConsoleMetrics,
    pub start_time: Instant,
}

/// Prometheus counters for admission decisions.
pub struct ConsoleMetrics {
    pub registry: Registry,
    pub requests_total: IntCounter,
    pub rate_limited_total: IntCounter,
    pub unresolved_client_total: IntCounter,
}

impl ConsoleMetrics {
    pub fn new() -> MempoolResult<Self> {
        let registry = Registry::new();

        let requests_total = IntCounter::with_opts(Opts::new(
            "mempool_requests_total",
            "Total number of requests that reached admission control",
        ))
        .map_err(anyhow::Error::from)?;

        let rate_limited_total = IntCounter::with_opts(Opts::new(
            "mempool_rate_limited_total",
            "Total number of requests rejected by the rate limiter",
        ))
        .map_err(anyhow::Error::from)?;

        let unresolved_client_total = IntCounter::with_opts(Opts::new(
            "mempool_unresolved_client_total",
            "Total number of requests whose client IP could not be resolved",
        ))
        .map_err(anyhow::Error::from)?;

        for counter in [&requests_total, &rate_limited_total, &unresolved_client_total] {
            registry
                .register(Box::new(counter.clone()))
                .map_err(anyhow::Error::from)?;
        }

        Ok(Self {
            registry,
            requests_total,
            rate_limited_total,
            unresolved_client_total,
        })
    }

    /// Render every registered counter in the Prometheus text format.
    pub fn render(&self) -> MempoolResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(anyhow::Error::from)?;
        String::from_utf8(buffer).map_err(|e| anyhow::Error::from(e).into())
    }
}

impl AppState {
    pub fn new(limiter: RateLimiter, rpc: Arc<dyn BitcoinRpc>) -> MempoolResult<Self> {
        Ok(Self {
            limiter,
            rpc,
            metrics: ConsoleMetrics::new()?,
            start_time: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_all_counters() {
        let metrics = ConsoleMetrics::new().unwrap();
        metrics.rate_limited_total.inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("mempool_requests_total 0"));
        assert!(text.contains("mempool_rate_limited_total 1"));
        assert!(text.contains("# TYPE mempool_unresolved_client_total counter"));
    }
}
