//! Header rewriting for proxied requests and responses.

use std::net::IpAddr;

use http::{HeaderMap, HeaderValue, Version, header};

use crate::parse::RequestHead;

/// Headers scoped to a single transport connection, never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "upgrade",
    "proxy-authorization",
    "proxy-connection",
    "trailer",
    "http2-settings",
];

/// Removes connection-scoped headers, including any named by `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Builds the header map to send upstream: the inbound headers minus
/// hop-by-hop control, plus a freshly synthesized `Forwarded`.
pub(crate) fn upstream_headers(req: &RequestHead) -> HeaderMap {
    let mut headers = req.headers.clone();
    strip_hop_by_hop(&mut headers);
    if let Ok(value) = HeaderValue::from_str(&forwarded_value(req)) {
        headers.insert(header::FORWARDED, value);
    }
    headers
}

/// Synthesizes `Forwarded` (RFC 7239): `by`, the connection's `for`, any
/// inbound `for` tokens in order, then `host` and `proto`.
fn forwarded_value(req: &RequestHead) -> String {
    let mut out = format!(
        "by={}; for={}",
        node_id(req.peer.local),
        node_id(req.peer.remote)
    );
    for value in req.headers.get_all(header::FORWARDED) {
        if let Ok(value) = value.to_str() {
            for token in forwarded_for_tokens(value) {
                out.push_str("; for=");
                out.push_str(token);
            }
        }
    }
    if let Some(host) = req.host() {
        out.push_str("; host=");
        out.push_str(host);
    }
    out.push_str(if req.peer.tls {
        "; proto=https"
    } else {
        "; proto=http"
    });
    out
}

fn node_id(addr: Option<IpAddr>) -> String {
    match addr {
        Some(addr) => addr.to_string(),
        // RFC 7239 identifier for an unknown peer.
        None => "unknown".to_string(),
    }
}

/// Extracts `for=` parameter values from a `Forwarded` value, leniently.
fn forwarded_for_tokens(value: &str) -> impl Iterator<Item = &str> {
    value
        .split([',', ';'])
        .filter_map(|part| {
            let part = part.trim();
            let prefix = part.get(..4)?;
            prefix
                .eq_ignore_ascii_case("for=")
                .then(|| part[4..].trim())
        })
        .filter(|token| !token.is_empty())
}

/// Appends this proxy's identity to the `Via` chain.
pub(crate) fn append_via(headers: &mut HeaderMap, version: Version, name: &str) {
    let entry = format!("{} {}", version_token(version), name);
    let value = match headers.get(header::VIA).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {entry}"),
        None => entry,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(header::VIA, value);
    }
}

/// Whether any `Via` entry already names this proxy.
pub(crate) fn via_contains(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get_all(header::VIA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|entry| {
            let entry = entry.trim();
            entry.len() >= name.len() && entry[entry.len() - name.len()..].eq_ignore_ascii_case(name)
        })
}

pub(crate) fn version_token(version: Version) -> &'static str {
    match version {
        v if v == Version::HTTP_09 => "0.9",
        v if v == Version::HTTP_10 => "1.0",
        v if v == Version::HTTP_2 => "2.0",
        v if v == Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}
