//! Identity functions for rate limiting.

use std::collections::HashMap;

/// How a request is mapped to the identity a counter is kept for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Use client IP address
    #[default]
    IpAddress,
    /// Client IP combined with a path parameter, e.g. one counter per (IP, coupon)
    IpAndPathParam(String),
}

impl KeyStrategy {
    /// Build the identity for a request. A missing path parameter falls back
    /// to the bare IP so the request is still counted.
    pub fn identity(&self, client_ip: &str, path_params: &HashMap<String, String>) -> String {
        match self {
            KeyStrategy::IpAddress => sanitize_key(client_ip),
            KeyStrategy::IpAndPathParam(name) => match path_params.get(name) {
                Some(value) => format!("{}:{}", sanitize_key(client_ip), canonical_param(value)),
                None => sanitize_key(client_ip),
            },
        }
    }
}

/// Where the client address used for rate limiting comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientIpSource {
    /// Socket peer address only; forwarding headers are ignored
    #[default]
    Peer,
    /// First hop of the proxy headers, falling back to the peer address
    ProxyHeaders,
}

impl ClientIpSource {
    pub fn from_trust_flag(trust_proxy_headers: bool) -> Self {
        if trust_proxy_headers {
            ClientIpSource::ProxyHeaders
        } else {
            ClientIpSource::Peer
        }
    }
}

/// Integer parameters are keyed by value so `7`, `07` and `+7` share a counter.
fn canonical_param(value: &str) -> String {
    match value.trim().parse::<i64>() {
        Ok(number) => number.to_string(),
        Err(_) => sanitize_key(value),
    }
}

/// Extract client IP from proxy headers, first hop wins
pub fn client_ip_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return Some(first_ip.to_string());
                }
            }
        }
    }

    headers
        .get("x-real-ip")
        .or_else(|| headers.get("cf-connecting-ip"))
        .and_then(|value| value.to_str().ok())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Sanitize key components to ensure valid Redis keys
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ':' || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
