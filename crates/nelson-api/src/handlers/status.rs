//! Daemon status handler.

use crate::AppState;
use axum::{extract::State, Json};
use nelson_heart::HeartSnapshot;
use nelson_peers::Peer;
use serde::Serialize;

/// Daemon status response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Node finished starting up.
    pub ready: bool,
    /// Last ledger health probe succeeded.
    pub iri_healthy: bool,
    /// Known peers.
    pub total_peers: usize,
    /// Identities of peers with an open link.
    pub connected_peers: Vec<Peer>,
    /// Running configuration.
    pub config: serde_json::Value,
    /// Scheduler clock.
    pub heart: HeartSnapshot,
}

/// GET /
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let connected_peers = state.connected.read().clone();

    Json(StatusResponse {
        ready: state.is_ready(),
        iri_healthy: state.iri.is_healthy(),
        total_peers: state.peers.len(),
        connected_peers,
        config: state.config_echo.clone(),
        heart: state.heart.snapshot(),
    })
}
