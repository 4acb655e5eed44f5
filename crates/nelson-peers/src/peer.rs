//! Peer entity.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound on a stored peer weight.
pub const MAX_WEIGHT: f64 = 4_000_000.0;

/// Opaque document id a peer is keyed by.
pub type PeerKey = u64;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The persistent identity of a remote participant.
///
/// One document per peer in the store; all mutations go through
/// [`crate::PeerList`] so the document and the in-memory record move
/// together.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// IP literal if numeric, FQDN otherwise. Canonical (cleaned) form.
    pub hostname: String,
    /// Resolved address, if known.
    pub ip: Option<IpAddr>,
    /// Peer-to-peer control port.
    pub port: u16,
    /// Ledger TCP neighbor port.
    pub tcp_port: u16,
    /// Ledger UDP neighbor port.
    pub udp_port: u16,
    /// Trust bit. Trusted peers survive epoch reshuffles.
    pub is_trusted: bool,
    /// Stored reputation weight, within [0, MAX_WEIGHT].
    pub weight: f64,
    /// Milliseconds since epoch when this peer was first seen.
    pub date_created: u64,
    /// Milliseconds since epoch of the last successful connection.
    pub date_last_connected: Option<u64>,
    /// Successful connection count.
    pub connected: u32,
    /// Failed attempts since the last success.
    pub tried: u32,
}

impl Peer {
    /// Create a fresh record for a newly discovered peer.
    pub fn new(
        hostname: String,
        ip: Option<IpAddr>,
        port: u16,
        tcp_port: u16,
        udp_port: u16,
        is_trusted: bool,
        weight: f64,
    ) -> Self {
        Self {
            hostname,
            ip,
            port,
            tcp_port,
            udp_port,
            is_trusted,
            weight: weight.clamp(0.0, MAX_WEIGHT),
            date_created: now_ms(),
            date_last_connected: None,
            connected: 0,
            tried: 0,
        }
    }

    /// Host part for ledger URIs; v6 literals are bracketed.
    fn uri_host(&self) -> String {
        match self.hostname.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
            _ => self.hostname.clone(),
        }
    }

    /// `udp://host:udp_port` for consumption by the ledger RPC.
    pub fn udp_uri(&self) -> String {
        format!("udp://{}:{}", self.uri_host(), self.udp_port)
    }

    /// `tcp://host:tcp_port` for consumption by the ledger RPC.
    pub fn tcp_uri(&self) -> String {
        format!("tcp://{}:{}", self.uri_host(), self.tcp_port)
    }
}

/// A shallow merge applied to a peer through [`crate::PeerList::update`].
#[derive(Debug, Clone, Default)]
pub struct PeerPatch {
    pub ip: Option<Option<IpAddr>>,
    pub port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub is_trusted: Option<bool>,
    pub weight: Option<f64>,
    pub date_last_connected: Option<Option<u64>>,
    pub connected: Option<u32>,
    pub tried: Option<u32>,
}

impl PeerPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ip(mut self, ip: Option<IpAddr>) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }

    pub fn udp_port(mut self, port: u16) -> Self {
        self.udp_port = Some(port);
        self
    }

    pub fn is_trusted(mut self, trusted: bool) -> Self {
        self.is_trusted = Some(trusted);
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn date_last_connected(mut self, at: Option<u64>) -> Self {
        self.date_last_connected = Some(at);
        self
    }

    pub fn connected(mut self, connected: u32) -> Self {
        self.connected = Some(connected);
        self
    }

    pub fn tried(mut self, tried: u32) -> Self {
        self.tried = Some(tried);
        self
    }

    /// Apply the patch. Weight is clamped to [0, MAX_WEIGHT].
    pub fn apply(&self, peer: &mut Peer) {
        if let Some(ip) = self.ip {
            peer.ip = ip;
        }
        if let Some(port) = self.port {
            peer.port = port;
        }
        if let Some(port) = self.tcp_port {
            peer.tcp_port = port;
        }
        if let Some(port) = self.udp_port {
            peer.udp_port = port;
        }
        if let Some(trusted) = self.is_trusted {
            peer.is_trusted = trusted;
        }
        if let Some(weight) = self.weight {
            peer.weight = weight.clamp(0.0, MAX_WEIGHT);
        }
        if let Some(at) = self.date_last_connected {
            peer.date_last_connected = at;
        }
        if let Some(connected) = self.connected {
            peer.connected = connected;
        }
        if let Some(tried) = self.tried {
            peer.tried = tried;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer() -> Peer {
        Peer::new(
            "node-a.example".to_string(),
            None,
            16600,
            15600,
            14600,
            false,
            1.0,
        )
    }

    #[test]
    fn test_new_peer_defaults() {
        let peer = sample_peer();
        assert_eq!(peer.connected, 0);
        assert_eq!(peer.tried, 0);
        assert!(peer.date_last_connected.is_none());
        assert!(peer.date_created > 0);
    }

    #[test]
    fn test_uris() {
        let peer = sample_peer();
        assert_eq!(peer.udp_uri(), "udp://node-a.example:14600");
        assert_eq!(peer.tcp_uri(), "tcp://node-a.example:15600");

        let mut v6 = sample_peer();
        v6.hostname = "2001:db8::1".to_string();
        assert_eq!(v6.udp_uri(), "udp://[2001:db8::1]:14600");
    }

    #[test]
    fn test_weight_clamped() {
        let peer = Peer::new("x".into(), None, 1, 2, 3, false, 9e9);
        assert_eq!(peer.weight, MAX_WEIGHT);

        let mut peer = sample_peer();
        PeerPatch::new().weight(-1.0).apply(&mut peer);
        assert_eq!(peer.weight, 0.0);
        PeerPatch::new().weight(9e9).apply(&mut peer);
        assert_eq!(peer.weight, MAX_WEIGHT);
    }

    #[test]
    fn test_patch_partial_merge() {
        let mut peer = sample_peer();
        let created = peer.date_created;

        PeerPatch::new()
            .connected(3)
            .date_last_connected(Some(created + 1000))
            .apply(&mut peer);

        assert_eq!(peer.connected, 3);
        assert_eq!(peer.date_last_connected, Some(created + 1000));
        // Untouched fields survive
        assert_eq!(peer.hostname, "node-a.example");
        assert_eq!(peer.tried, 0);
    }

    #[test]
    fn test_document_roundtrip() {
        let peer = sample_peer();
        let doc = serde_json::to_vec(&peer).unwrap();
        let back: Peer = serde_json::from_slice(&doc).unwrap();
        assert_eq!(back.hostname, peer.hostname);
        assert_eq!(back.udp_port, peer.udp_port);
        assert_eq!(back.date_created, peer.date_created);
    }
}
