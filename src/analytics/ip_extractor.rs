//! Request metadata supplied by the hosting layer
//!
//! The pipeline never sees the socket; it trusts the proxy headers the
//! hosting layer forwards:
//! - `x-forwarded-for` (first hop is the original client)
//! - `x-real-ip`
//! - `user-agent`, `referer`

use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Placeholder used when no client IP can be determined
pub const UNKNOWN_IP: &str = "unknown";

/// Raw request metadata relevant to click recording
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub forwarded_for: Option<String>,
    pub real_ip: Option<String>,
    pub user_agent: String,
    pub referer: String,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl RequestMetadata {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            forwarded_for: header_str(headers, "x-forwarded-for"),
            real_ip: header_str(headers, "x-real-ip"),
            user_agent: header_str(headers, "user-agent").unwrap_or_default(),
            referer: header_str(headers, "referer").unwrap_or_default(),
        }
    }

    /// Best-available client IP: first `x-forwarded-for` hop, then
    /// `x-real-ip`, then [`UNKNOWN_IP`]
    pub fn client_ip(&self) -> String {
        self.forwarded_for
            .as_deref()
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .or_else(|| self.real_ip.as_deref())
            .unwrap_or(UNKNOWN_IP)
            .to_string()
    }
}

/// Parse a client IP string, accepting `ip:port` and `[v6]:port` forms
pub fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip);
    }

    if let Some(rest) = raw.strip_prefix('[') {
        return rest.split(']').next()?.parse::<IpAddr>().ok();
    }

    // IPv4 with port; bare IPv6 was handled above
    let (host, _port) = raw.rsplit_once(':')?;
    host.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
}

/// Whether an address can never be located by a geo provider
pub fn is_unroutable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => {
            addr.is_private()
                || addr.is_loopback()
                || addr.is_link_local()
                || addr.is_unspecified()
                || addr.is_broadcast()
                || addr.is_documentation()
        }
        IpAddr::V6(addr) => {
            let first = addr.segments()[0];
            addr.is_loopback()
                || addr.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Anonymize an IP address by truncating to network prefix
///
/// - IPv4: Truncate to /24 (zero last octet)
/// - IPv6: Truncate to /48 (zero last 80 bits)
pub fn anonymize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(addr) => {
            let octets = addr.octets();
            IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], 0))
        }
        IpAddr::V6(addr) => {
            let segments = addr.segments();
            IpAddr::V6(Ipv6Addr::new(
                segments[0],
                segments[1],
                segments[2],
                0,
                0,
                0,
                0,
                0,
            ))
        }
    }
}

/// Anonymize a raw IP string; unparseable values are stored as [`UNKNOWN_IP`]
pub fn anonymize_ip_str(raw: &str) -> String {
    parse_ip(raw)
        .map(|ip| anonymize_ip(ip).to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}
