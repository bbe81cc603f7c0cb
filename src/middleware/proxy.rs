//! Proxy-aware remote address (spec.md §4.13): when the server trusts
//! proxies, resolve the remote address from the first `X-Forwarded-For`
//! entry instead of the raw connection peer.

use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;

/// The resolved remote address, inserted into request extensions for
/// downstream extraction by `RequestContextBuilder`.
#[derive(Debug, Clone)]
pub struct RemoteAddr(pub String);

/// Apply with `axum::middleware::from_fn_with_state(trust_proxies, resolve_remote_addr)`.
pub async fn resolve_remote_addr(
    axum::extract::State(trust_proxies): axum::extract::State<bool>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut request: Request,
    next: Next,
) -> Response {
    let forwarded = trust_proxies
        .then(|| first_forwarded_ip(request.headers()))
        .flatten();

    let remote = forwarded.unwrap_or_else(|| {
        connect_info
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    });

    request.extensions_mut().insert(RemoteAddr(remote));
    next.run(request).await
}

fn first_forwarded_ip(headers: &axum::http::HeaderMap) -> Option<String> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    value.split(',').next().map(|ip| ip.trim().to_string())
}
