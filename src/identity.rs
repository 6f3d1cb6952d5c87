//! Best-effort client identity resolution.
//!
//! The address comes from a prioritized list of proxy headers and is only
//! trusted when it parses as an IP. The fingerprint hashes several headers so
//! clients sharing an address (NAT, corporate proxies) can still be told
//! apart by the rate limiter.

use std::net::{IpAddr, Ipv4Addr};

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

const FINGERPRINT_LEN: usize = 16;

#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub addr: String,
    pub fingerprint: String,
}

impl ClientIdentity {
    /// Key used for rate-limit counters and telemetry correlation.
    pub fn rate_key(&self) -> String {
        format!("{}:{}", self.addr, self.fingerprint)
    }
}

pub fn resolve(headers: &HeaderMap) -> ClientIdentity {
    let addr = client_addr(headers);
    let fingerprint = fingerprint(headers, &addr);
    ClientIdentity { addr, fingerprint }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Resolution order: edge-proxy header, generic real-IP header, first entry
/// of the forwarded-for chain. Anything that does not look like an IP is
/// normalized to "unknown" rather than trusted blindly.
fn client_addr(headers: &HeaderMap) -> String {
    let candidate = header(headers, "cf-connecting-ip")
        .or_else(|| header(headers, "x-real-ip"))
        .or_else(|| {
            header(headers, "x-forwarded-for").and_then(|chain| chain.split(',').next())
        });
    candidate
        .and_then(normalize_addr)
        .unwrap_or_else(|| "unknown".to_string())
}

fn normalize_addr(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.parse::<IpAddr>().is_ok() {
        return Some(trimmed.to_string());
    }
    // v4 with a port suffix, e.g. "203.0.113.9:4432"
    if let Some((host, _port)) = trimmed.rsplit_once(':') {
        if host.parse::<Ipv4Addr>().is_ok() {
            return Some(host.to_string());
        }
    }
    None
}

fn fingerprint(headers: &HeaderMap, addr: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(addr.as_bytes());
    for name in ["user-agent", "accept-language", "accept-encoding"] {
        hasher.update(b"|");
        hasher.update(header(headers, name).unwrap_or("unknown").as_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}
