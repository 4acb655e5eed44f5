//! # nelson-network
//!
//! Peer-link layer for the Nelson daemon.
//!
//! This crate provides:
//! - Frame codec for the peer-link wire protocol
//! - Hello / gossip / beat messages
//! - Link sessions with liveness deadlines and an event stream

mod codec;
mod error;
mod link;
mod message;

pub use codec::LinkCodec;
pub use error::{NetworkError, NetworkResult};
pub use link::{
    accept_link, open_link, CloseReason, LinkConfig, LinkDirection, LinkEvent, LinkHandle, LinkId,
    LinkState,
};
pub use message::{Hello, Message, MessageType, PeerAdvert};

/// Protocol magic bytes.
pub const MAGIC: [u8; 4] = [0x4e, 0x4c, 0x53, 0x4e];

/// Maximum frame payload size.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;
