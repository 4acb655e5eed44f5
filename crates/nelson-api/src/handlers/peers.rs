//! Peer handlers.

use crate::AppState;
use axum::{extract::State, Json};
use nelson_peers::{now_ms, Peer, PeerStats};

/// GET /peers
pub async fn get_peers(State(state): State<AppState>) -> Json<Vec<Peer>> {
    let peers: Vec<Peer> = state.peers.all().into_iter().map(|(_, p)| p).collect();
    Json(peers)
}

/// GET /peer-stats
pub async fn get_peer_stats(State(state): State<AppState>) -> Json<PeerStats> {
    let peers: Vec<Peer> = state.peers.all().into_iter().map(|(_, p)| p).collect();
    Json(PeerStats::compute(&peers, now_ms()))
}
