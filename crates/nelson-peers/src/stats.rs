//! Trailing-window peer statistics for the status API.

use crate::peer::Peer;
use serde::Serialize;

const HOUR_MS: u64 = 60 * 60 * 1000;

/// Counts over the trailing 1h/4h/12h/24h/7d windows.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WindowCounts {
    pub hour_ago: usize,
    pub four_hours_ago: usize,
    pub twelve_hours_ago: usize,
    pub day_ago: usize,
    pub week_ago: usize,
}

impl WindowCounts {
    fn count<F: Fn(&Peer) -> Option<u64>>(peers: &[Peer], now: u64, stamp: F) -> Self {
        let within = |window_ms: u64| {
            peers
                .iter()
                .filter(|p| stamp(p).is_some_and(|at| at >= now.saturating_sub(window_ms)))
                .count()
        };
        Self {
            hour_ago: within(HOUR_MS),
            four_hours_ago: within(4 * HOUR_MS),
            twelve_hours_ago: within(12 * HOUR_MS),
            day_ago: within(24 * HOUR_MS),
            week_ago: within(7 * 24 * HOUR_MS),
        }
    }
}

/// Peers first-seen and last-active over the trailing windows.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStats {
    pub new_peers: WindowCounts,
    pub active_peers: WindowCounts,
}

impl PeerStats {
    /// Compute stats for a peer snapshot at `now` (ms since epoch).
    pub fn compute(peers: &[Peer], now: u64) -> Self {
        Self {
            new_peers: WindowCounts::count(peers, now, |p| Some(p.date_created)),
            active_peers: WindowCounts::count(peers, now, |p| p.date_last_connected),
        }
    }
}
