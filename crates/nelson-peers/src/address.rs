//! Address normalization and DNS resolution.
//!
//! Every address entering the peer list passes through [`clean_address`],
//! which is the canonical form used in storage and equality checks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Check whether a string parses as a v4 or v6 literal.
pub fn looks_like_ip(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok()
}

/// Extract the embedded v4 address from a `::ffff:a.b.c.d` mapped literal.
fn mapped_v4(v6: &Ipv6Addr) -> Option<Ipv4Addr> {
    let o = v6.octets();
    if o[..10] == [0u8; 10] && o[10] == 0xff && o[11] == 0xff {
        Some(Ipv4Addr::new(o[12], o[13], o[14], o[15]))
    } else {
        None
    }
}

/// Check whether an address belongs to a private or local range.
fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            // fc00::/7 unique-local, fe80::/10 link-local
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Normalize an address to its canonical form.
///
/// IP literals have a leading `::ffff:` mapped-v4 prefix stripped; literals
/// in a private range are rewritten to `localhost`. Hostnames pass through
/// unchanged. Idempotent.
pub fn clean_address(address: &str) -> String {
    let Ok(ip) = address.parse::<IpAddr>() else {
        return address.to_string();
    };

    let ip = match ip {
        IpAddr::V6(v6) => mapped_v4(&v6).map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };

    if is_private(&ip) {
        "localhost".to_string()
    } else {
        ip.to_string()
    }
}

/// Resolve a hostname to its first A/AAAA record.
///
/// Runs the blocking resolver off the async runtime with a timeout; a
/// failed or timed-out lookup yields `None`.
pub async fn resolve_host(hostname: &str, dns_timeout: Duration) -> Option<IpAddr> {
    let host = format!("{}:0", hostname);

    let result = timeout(
        dns_timeout,
        tokio::task::spawn_blocking(move || {
            host.to_socket_addrs()
                .ok()
                .and_then(|mut iter| iter.next())
                .map(|addr| addr.ip())
        }),
    )
    .await;

    match result {
        Ok(Ok(ip)) => ip,
        Ok(Err(e)) => {
            debug!(hostname = %hostname, error = %e, "DNS task failed");
            None
        }
        Err(_) => {
            debug!(hostname = %hostname, "DNS lookup timed out");
            None
        }
    }
}

/// A peer URI of the form `hostname/port/tcp_port/udp_port`.
///
/// Trailing segments may be omitted and fall back to the supplied defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUri {
    pub hostname: String,
    pub port: u16,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl PeerUri {
    /// Parse a peer URI, filling missing segments from defaults.
    ///
    /// Returns `None` for an empty hostname or an unparseable port.
    pub fn parse(uri: &str, default_port: u16, default_tcp: u16, default_udp: u16) -> Option<Self> {
        let mut parts = uri.trim().split('/');

        let hostname = parts.next()?.trim();
        if hostname.is_empty() {
            return None;
        }

        let mut next_port = |fallback: u16| -> Option<u16> {
            match parts.next() {
                None => Some(fallback),
                Some("") => Some(fallback),
                Some(raw) => raw.trim().parse().ok(),
            }
        };

        let port = next_port(default_port)?;
        let tcp_port = next_port(default_tcp)?;
        let udp_port = next_port(default_udp)?;

        Some(Self {
            hostname: hostname.to_string(),
            port,
            tcp_port,
            udp_port,
        })
    }
}
