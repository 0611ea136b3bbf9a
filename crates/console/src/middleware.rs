//! Admission control in front of every console route.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::debug;

use crate::state::SharedState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientIpError {
    #[error("IP not found")]
    NotFound,
}

/// Resolve the IP a request should be rate limited under.
///
/// The last entry of `X-Forwarded-For` wins, since a load balancer appends
/// the address it actually saw. Without a usable header the peer address of
/// the connection is used. IPv6 loopback is reported as `127.0.0.1`.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<String, ClientIpError> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit(',').next())
        .and_then(|last| last.trim().parse::<IpAddr>().ok());

    forwarded
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(normalize)
        .map(|ip| ip.to_string())
        .ok_or(ClientIpError::NotFound)
}

fn normalize(ip: IpAddr) -> IpAddr {
    if ip == IpAddr::V6(std::net::Ipv6Addr::LOCALHOST) {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        ip
    }
}

/// Reject requests over their client's rate with 429 and requests with no
/// resolvable client with 400; forward everything else untouched.
pub async fn rate_limit(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let ip = match client_ip(request.headers(), peer) {
        Ok(ip) => ip,
        Err(e) => {
            debug!(error = %e, "could not resolve client ip");
            state.metrics.unresolved_client_total.inc();
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    state.metrics.requests_total.inc();

    if !state.limiter.is_allowed(&ip) {
        debug!(client_ip = %ip, "rate limit exceeded");
        state.metrics.rate_limited_total.inc();
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(forwarded_for: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_str(forwarded_for).unwrap());
        headers
    }

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().unwrap())
    }

    #[test]
    fn uses_last_forwarded_entry() {
        let ip = client_ip(&headers("203.0.113.7, 198.51.100.2"), peer("10.0.0.1:5000")).unwrap();
        assert_eq!(ip, "198.51.100.2");
    }

    #[test]
    fn falls_back_to_peer_when_last_entry_is_garbage() {
        let ip = client_ip(&headers("203.0.113.7, unknown"), peer("10.0.0.1:5000")).unwrap();
        assert_eq!(ip, "10.0.0.1");
    }

    #[test]
    fn falls_back_to_peer_without_header() {
        let ip = client_ip(&HeaderMap::new(), peer("192.0.2.10:443")).unwrap();
        assert_eq!(ip, "192.0.2.10");
    }

    #[test]
    fn ipv6_loopback_becomes_ipv4_loopback() {
        assert_eq!(client_ip(&HeaderMap::new(), peer("[::1]:8080")).unwrap(), "127.0.0.1");
        assert_eq!(client_ip(&headers("::1"), None).unwrap(), "127.0.0.1");
    }

    #[test]
    fn other_ipv6_addresses_keep_canonical_form() {
        let ip = client_ip(&HeaderMap::new(), peer("[2001:db8:0:0::1]:8080")).unwrap();
        assert_eq!(ip, "2001:db8::1");
    }

    #[test]
    fn no_header_and_no_peer_is_an_error() {
        assert_eq!(client_ip(&HeaderMap::new(), None), Err(ClientIpError::NotFound));
        assert_eq!(client_ip(&headers("not-an-ip"), None), Err(ClientIpError::NotFound));
    }
}
