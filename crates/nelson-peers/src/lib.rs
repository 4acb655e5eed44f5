//! # nelson-peers
//!
//! Peer lifecycle for the Nelson daemon.
//!
//! This crate provides:
//! - The persistent [`Peer`] entity and its document form
//! - Address normalization and DNS resolution
//! - The [`PeerList`]: load, dedup, trust, weighted sampling
//! - Trailing-window peer statistics for the status API

mod address;
mod error;
mod list;
mod peer;
mod stats;

pub use address::{clean_address, looks_like_ip, resolve_host, PeerUri};
pub use error::{PeerError, PeerResult};
pub use list::{PeerList, PeerListConfig};
pub use peer::{now_ms, Peer, PeerKey, PeerPatch, MAX_WEIGHT};
pub use stats::{PeerStats, WindowCounts};
