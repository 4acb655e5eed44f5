//! Shared application state.

use nelson_heart::HeartMonitor;
use nelson_iri::IriClient;
use nelson_peers::{Peer, PeerList};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared application state for API handlers.
#[derive(Clone)]
pub struct AppState {
    /// The peer list.
    pub peers: Arc<PeerList>,
    /// The ledger client.
    pub iri: Arc<IriClient>,
    /// Scheduler clock view.
    pub heart: HeartMonitor,
    /// Identities of peers with an open link, maintained by the node.
    pub connected: Arc<RwLock<Vec<Peer>>>,
    /// Flips once the node has finished starting up.
    ready: Arc<AtomicBool>,
    /// Echo of the running configuration.
    pub config_echo: serde_json::Value,
}

impl AppState {
    /// Create a new app state.
    pub fn new(
        peers: Arc<PeerList>,
        iri: Arc<IriClient>,
        heart: HeartMonitor,
        connected: Arc<RwLock<Vec<Peer>>>,
        config_echo: serde_json::Value,
    ) -> Self {
        Self {
            peers,
            iri,
            heart,
            connected,
            ready: Arc::new(AtomicBool::new(false)),
            config_echo,
        }
    }

    /// Mark the node ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Whether the node has finished starting up.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
