use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ApiError;
use crate::key_generator::{client_ip_from_headers, ClientIpSource};
use crate::rate_limiter::RateLimiter;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Logging middleware for request/response tracking
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = get_client_ip(&request, ClientIpSource::Peer);
    let forwarded_for = client_ip_from_headers(request.headers());

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        target: "discountdb::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        forwarded_for = ?forwarded_for,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    let status = response.status();
    info!(
        target: "discountdb::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Fixed-window gate. Must be attached per route (`MethodRouter::layer`) so
/// path parameters are available to identity strategies that need them.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    path: Option<Path<HashMap<String, String>>>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = get_client_ip(&request, limiter.ip_source());
    let params = path.map(|Path(params)| params).unwrap_or_default();
    let identity = limiter.strategy().identity(&client_ip, &params);

    let decision = match limiter.admit(&identity).await {
        Ok(decision) => decision,
        Err(err) => return err.into_response(),
    };

    if !decision.allowed {
        debug!(
            target: "discountdb::middleware",
            prefix = %limiter.rule().key_prefix,
            identity = %identity,
            reset_in = decision.reset_in,
            "Rate limit exceeded"
        );
        let mut response = ApiError::RateLimitExceeded {
            retry_after: decision.retry_after.unwrap_or(1),
        }
        .into_response();
        decision.apply_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    decision.merge_headers(response.headers_mut());
    response
}

fn get_client_ip(request: &Request, source: ClientIpSource) -> String {
    if source == ClientIpSource::ProxyHeaders {
        if let Some(ip) = client_ip_from_headers(request.headers()) {
            return ip;
        }
    }

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarded_request() -> Request {
        let mut request = Request::new(axum::body::Body::empty());
        request.headers_mut().insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.168.1.1, 10.0.0.1"),
        );
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 7], 40000))));
        request
    }

    #[test]
    fn test_get_client_ip_with_trusted_forwarded_header() {
        let ip = get_client_ip(&forwarded_request(), ClientIpSource::ProxyHeaders);
        assert_eq!(ip, "192.168.1.1");
    }

    #[test]
    fn test_forwarded_header_ignored_unless_trusted() {
        let ip = get_client_ip(&forwarded_request(), ClientIpSource::Peer);
        assert_eq!(ip, "198.51.100.7");
    }

    #[test]
    fn test_trusted_source_falls_back_to_connect_info() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 7], 40000))));

        let ip = get_client_ip(&request, ClientIpSource::ProxyHeaders);
        assert_eq!(ip, "198.51.100.7");
    }

    #[test]
    fn test_get_client_ip_fallback() {
        let request = Request::new(axum::body::Body::empty());
        assert_eq!(get_client_ip(&request, ClientIpSource::Peer), "unknown");
    }
}
