//! Header manipulation and security headers.
//!
//! # Responsibilities
//! - Add X-Forwarded-For, X-Forwarded-Proto, X-Forwarded-Host, X-Real-IP
//! - Strip hop-by-hop headers in both directions
//! - Build the fixed security response headers
//!
//! # Design Decisions
//! - Host is preserved so the backend sees the name the client used
//! - X-Forwarded-For is appended to, never replaced
//! - Security headers override whatever the backend sent

use std::net::IpAddr;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::config::schema::SecurityHeadersConfig;

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Add forwarding headers for a request from `client` over `scheme`.
pub fn add_forwarding_headers(headers: &mut HeaderMap, client: IpAddr, scheme: &str) {
    let client_str = client.to_string();

    let forwarded_for = match headers
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
    {
        Some(existing) => format!("{existing}, {client_str}"),
        None => client_str.clone(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_str) {
        headers.insert(X_REAL_IP, value);
    }
    if let Ok(value) = HeaderValue::from_str(scheme) {
        headers.insert(X_FORWARDED_PROTO, value);
    }
    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
}

/// The security headers to set on every response. Empty values are skipped
/// so a deployment can turn a single header off.
pub fn security_headers(config: &SecurityHeadersConfig) -> Vec<(HeaderName, HeaderValue)> {
    [
        (header::X_CONTENT_TYPE_OPTIONS, &config.content_type_options),
        (header::X_FRAME_OPTIONS, &config.frame_options),
        (header::STRICT_TRANSPORT_SECURITY, &config.strict_transport_security),
        (header::REFERRER_POLICY, &config.referrer_policy),
        (HeaderName::from_static("permissions-policy"), &config.permissions_policy),
        (header::CONTENT_SECURITY_POLICY, &config.content_security_policy),
    ]
    .into_iter()
    .filter(|(_, value)| !value.is_empty())
    .filter_map(|(name, value)| HeaderValue::from_str(value).ok().map(|v| (name, v)))
    .collect()
}
