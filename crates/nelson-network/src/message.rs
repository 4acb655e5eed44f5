//! Peer-to-peer control messages.

use nelson_peers::Peer;
use serde::{Deserialize, Serialize};

/// A peer identity as carried in hello and gossip messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAdvert {
    /// Advertised hostname. May be empty for the sender's own identity,
    /// in which case the receiver falls back to the socket address.
    pub hostname: String,
    /// Peer-to-peer control port.
    pub port: u16,
    /// Ledger TCP neighbor port.
    pub tcp_port: u16,
    /// Ledger UDP neighbor port.
    pub udp_port: u16,
    /// Trust bit claimed by the sender.
    pub is_trusted: bool,
    /// Weight hint for the receiver's `add`.
    pub weight: f64,
}

impl PeerAdvert {
    /// Advert for a known peer, with a weight hint.
    pub fn from_peer(peer: &Peer, weight: f64) -> Self {
        Self {
            hostname: peer.hostname.clone(),
            port: peer.port,
            tcp_port: peer.tcp_port,
            udp_port: peer.udp_port,
            is_trusted: peer.is_trusted,
            weight,
        }
    }
}

/// Sent by each side when a link opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// The sender's own advertised identity.
    pub identity: PeerAdvert,
    /// A weighted sample of the sender's known peers.
    pub peers: Vec<PeerAdvert>,
}

/// Message types on a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    Peers = 2,
    Beat = 3,
}

impl MessageType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Hello),
            2 => Some(MessageType::Peers),
            3 => Some(MessageType::Beat),
            _ => None,
        }
    }
}

/// A peer-link message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Identity plus gossip, sent on open.
    Hello(Hello),
    /// A further gossip sample.
    Peers(Vec<PeerAdvert>),
    /// Liveness tick.
    Beat,
}

impl Message {
    /// The wire type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Peers(_) => MessageType::Peers,
            Message::Beat => MessageType::Beat,
        }
    }

    /// Encode the payload (without framing).
    pub fn encode_payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Message::Hello(hello) => serde_json::to_vec(hello),
            Message::Peers(peers) => serde_json::to_vec(peers),
            Message::Beat => Ok(Vec::new()),
        }
    }

    /// Decode a payload for a wire type.
    pub fn decode_payload(kind: MessageType, payload: &[u8]) -> serde_json::Result<Self> {
        match kind {
            MessageType::Hello => Ok(Message::Hello(serde_json::from_slice(payload)?)),
            MessageType::Peers => Ok(Message::Peers(serde_json::from_slice(payload)?)),
            MessageType::Beat => Ok(Message::Beat),
        }
    }
}
