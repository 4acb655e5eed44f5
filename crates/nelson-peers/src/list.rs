//! Persistent peer list with lookup and weighted sampling.

use crate::address::{clean_address, looks_like_ip, resolve_host, PeerUri};
use crate::peer::{now_ms, Peer, PeerKey, PeerPatch, MAX_WEIGHT};
use crate::{PeerError, PeerResult};
use dashmap::DashMap;
use nelson_store::{ColumnFamily, Store};
use rand::Rng;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Weight multiplier applied on a successful connect. Reserved at 1.0.
const CONNECT_WEIGHT_MULTIPLIER: f64 = 1.0;

/// Peer list configuration.
#[derive(Debug, Clone)]
pub struct PeerListConfig {
    /// Permit multiple peers per hostname, differentiated by port.
    pub multi_port: bool,
    /// Weight peers by connection longevity instead of stored weight.
    pub is_master: bool,
    /// Default peer-to-peer port for URIs without one.
    pub default_port: u16,
    /// Default ledger TCP port for URIs without one.
    pub default_tcp_port: u16,
    /// Default ledger UDP port for URIs without one.
    pub default_udp_port: u16,
    /// DNS lookup timeout.
    pub dns_timeout: Duration,
}

impl Default for PeerListConfig {
    fn default() -> Self {
        Self {
            multi_port: false,
            is_master: false,
            default_port: 16600,
            default_tcp_port: 15600,
            default_udp_port: 14600,
            dns_timeout: Duration::from_secs(5),
        }
    }
}

/// Persistent collection of peers keyed by an opaque document id.
///
/// The list owns every peer record; callers hold [`PeerKey`]s and receive
/// cloned snapshots. Every mutation writes the document to the store before
/// committing to memory.
pub struct PeerList {
    config: PeerListConfig,
    store: Arc<dyn Store>,
    peers: DashMap<PeerKey, Peer>,
    next_key: AtomicU64,
}

impl PeerList {
    /// Create a peer list over an opened store. Call [`PeerList::load`]
    /// before use.
    pub fn new(store: Arc<dyn Store>, config: PeerListConfig) -> Self {
        Self {
            config,
            store,
            peers: DashMap::new(),
            next_key: AtomicU64::new(0),
        }
    }

    /// Read all records from the store, then upsert each default URI as a
    /// trusted peer with weight 1.0. Idempotent.
    pub async fn load(&self, defaults: &[String]) -> PeerResult<()> {
        let entries = self.store.iter(ColumnFamily::Peers)?;

        self.peers.clear();
        let mut max_key = 0u64;
        for (raw_key, raw_doc) in entries {
            let Ok(key_bytes) = <[u8; 8]>::try_from(raw_key.as_slice()) else {
                warn!("Skipping peer document with malformed key");
                continue;
            };
            let key = u64::from_be_bytes(key_bytes);

            match serde_json::from_slice::<Peer>(&raw_doc) {
                Ok(peer) => {
                    max_key = max_key.max(key);
                    self.peers.insert(key, peer);
                }
                Err(e) => {
                    warn!(key, error = %e, "Skipping undecodable peer document");
                }
            }
        }
        self.next_key.store(max_key + 1, Ordering::SeqCst);

        info!(count = self.peers.len(), "Loaded peers from store");

        for uri in defaults {
            let parsed = PeerUri::parse(
                uri,
                self.config.default_port,
                self.config.default_tcp_port,
                self.config.default_udp_port,
            );
            match parsed {
                Some(u) => {
                    self.add(&u.hostname, u.port, u.tcp_port, u.udp_port, true, 1.0)
                        .await?;
                }
                None => {
                    warn!(uri = %uri, "Skipping malformed default peer URI");
                }
            }
        }

        Ok(())
    }

    /// Add a peer or update a matching one.
    ///
    /// An existing match keeps its record; ports are refreshed when
    /// `multi_port` is off and any differ, weight is raised when the
    /// supplied weight exceeds the stored one, and trust is raised but
    /// never revoked.
    pub async fn add(
        &self,
        hostname: &str,
        port: u16,
        tcp_port: u16,
        udp_port: u16,
        is_trusted: bool,
        weight: f64,
    ) -> PeerResult<(PeerKey, Peer)> {
        let cleaned = clean_address(hostname);
        let ip = self.resolve(&cleaned).await;

        if let Some((key, existing)) = self.find_matches(&cleaned, hostname, ip, port).into_iter().next() {
            let mut patch = PeerPatch::new();
            let mut dirty = false;

            if !self.config.multi_port
                && (existing.port != port
                    || existing.tcp_port != tcp_port
                    || existing.udp_port != udp_port)
            {
                patch = patch.port(port).tcp_port(tcp_port).udp_port(udp_port);
                dirty = true;
            }
            if weight > existing.weight {
                patch = patch.weight(weight);
                dirty = true;
            }
            if is_trusted && !existing.is_trusted {
                patch = patch.is_trusted(true);
                dirty = true;
            }

            if dirty {
                let updated = self.update(key, patch)?;
                return Ok((key, updated));
            }
            return Ok((key, existing));
        }

        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let peer = Peer::new(cleaned, ip, port, tcp_port, udp_port, is_trusted, weight);

        self.persist(key, &peer)?;
        self.peers.insert(key, peer.clone());

        debug!(hostname = %peer.hostname, port, trusted = is_trusted, "Added peer");
        Ok((key, peer))
    }

    /// Find peers matching an address.
    ///
    /// Matches the cleaned hostname, the raw address, or the resolved IP.
    /// DNS is skipped for IP literals and under `multi_port`; under
    /// `multi_port` matches are further filtered by port.
    pub async fn find_by_address(&self, address: &str, port: u16) -> Vec<(PeerKey, Peer)> {
        let cleaned = clean_address(address);
        let ip = self.resolve(&cleaned).await;
        self.find_matches(&cleaned, address, ip, port)
    }

    async fn resolve(&self, cleaned: &str) -> Option<IpAddr> {
        if looks_like_ip(cleaned) {
            return cleaned.parse().ok();
        }
        if self.config.multi_port {
            return None;
        }
        resolve_host(cleaned, self.config.dns_timeout).await
    }

    fn find_matches(
        &self,
        cleaned: &str,
        raw: &str,
        ip: Option<IpAddr>,
        port: u16,
    ) -> Vec<(PeerKey, Peer)> {
        let mut out: Vec<(PeerKey, Peer)> = self
            .peers
            .iter()
            .filter(|entry| {
                let p = entry.value();
                let matched = p.hostname == cleaned
                    || p.hostname == raw
                    || (ip.is_some() && p.ip == ip);
                matched && (!self.config.multi_port || p.port == port)
            })
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        out.sort_by_key(|(key, _)| *key);
        out
    }

    /// Shallow-merge a patch into a peer and write it through.
    ///
    /// A store failure leaves the in-memory record untouched.
    pub fn update(&self, key: PeerKey, patch: PeerPatch) -> PeerResult<Peer> {
        let mut entry = self.peers.get_mut(&key).ok_or(PeerError::NotFound(key))?;

        let mut updated = entry.value().clone();
        patch.apply(&mut updated);

        self.persist(key, &updated)?;
        *entry.value_mut() = updated.clone();
        Ok(updated)
    }

    /// Record a successful connection: reset `tried`, bump `connected`,
    /// stamp `date_last_connected`, apply the connect weight multiplier.
    pub fn mark_connected(&self, key: PeerKey) -> PeerResult<Peer> {
        let current = self.get(key).ok_or(PeerError::NotFound(key))?;
        let patch = PeerPatch::new()
            .tried(0)
            .connected(current.connected + 1)
            .date_last_connected(Some(now_ms()))
            .weight((current.weight * CONNECT_WEIGHT_MULTIPLIER).min(MAX_WEIGHT));
        self.update(key, patch)
    }

    /// Record a failed attempt.
    pub fn mark_tried(&self, key: PeerKey) -> PeerResult<Peer> {
        let current = self.get(key).ok_or(PeerError::NotFound(key))?;
        self.update(key, PeerPatch::new().tried(current.tried + 1))
    }

    /// Wipe the store and the in-memory list.
    pub fn clear(&self) -> PeerResult<()> {
        self.store.clear(ColumnFamily::Peers)?;
        self.peers.clear();
        info!("Peer list cleared");
        Ok(())
    }

    /// True iff any peer matching the URI carries the trust bit.
    pub async fn is_trusted_uri(&self, uri: &str) -> bool {
        let Some(parsed) = PeerUri::parse(
            uri,
            self.config.default_port,
            self.config.default_tcp_port,
            self.config.default_udp_port,
        ) else {
            return false;
        };
        self.find_by_address(&parsed.hostname, parsed.port)
            .await
            .iter()
            .any(|(_, p)| p.is_trusted)
    }

    /// Effective sampling weight of a peer.
    ///
    /// Master mode rewards connection longevity; normal mode ages peers in
    /// by seconds-since-created times the stored weight. Never below 1.
    pub fn peer_weight(&self, peer: &Peer) -> f64 {
        if self.config.is_master {
            let held_s = peer
                .date_last_connected
                .map(|lc| lc.saturating_sub(peer.date_created) / 1000)
                .unwrap_or(0);
            (held_s as f64).max(1.0)
        } else {
            let age_s = now_ms().saturating_sub(peer.date_created) / 1000;
            (age_s as f64 * peer.weight).max(1.0)
        }
    }

    /// Weighted sample without replacement.
    ///
    /// Draws up to `amount` peers (0 means all) with probability
    /// proportional to [`PeerList::peer_weight`], removing each pick and its
    /// weight from the pool together. The returned ratio is the pick's
    /// weight over the pool maximum; trusted peers always report 1.0.
    pub fn get_weighted(
        &self,
        amount: usize,
        source: Option<Vec<(PeerKey, Peer)>>,
    ) -> Vec<(PeerKey, Peer, f64)> {
        let mut pool: Vec<(PeerKey, Peer, f64)> = source
            .unwrap_or_else(|| self.all())
            .into_iter()
            .map(|(key, peer)| {
                let weight = self.peer_weight(&peer);
                (key, peer, weight)
            })
            .collect();

        let weights_max = pool.iter().map(|(_, _, w)| *w).fold(0.0f64, f64::max);
        let amount = if amount == 0 {
            pool.len()
        } else {
            amount.min(pool.len())
        };

        let mut rng = rand::thread_rng();
        let mut picked = Vec::with_capacity(amount);

        while picked.len() < amount && !pool.is_empty() {
            let total: f64 = pool.iter().map(|(_, _, w)| *w).sum();
            let mut target = rng.gen::<f64>() * total;

            let mut idx = pool.len() - 1;
            for (i, (_, _, w)) in pool.iter().enumerate() {
                if target < *w {
                    idx = i;
                    break;
                }
                target -= *w;
            }

            let (key, peer, weight) = pool.swap_remove(idx);
            let ratio = if peer.is_trusted {
                1.0
            } else {
                weight / weights_max
            };
            picked.push((key, peer, ratio));
        }

        picked
    }

    /// Snapshot of one peer.
    pub fn get(&self, key: PeerKey) -> Option<Peer> {
        self.peers.get(&key).map(|entry| entry.value().clone())
    }

    /// Snapshot of every peer.
    pub fn all(&self) -> Vec<(PeerKey, Peer)> {
        let mut out: Vec<(PeerKey, Peer)> = self
            .peers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        out.sort_by_key(|(key, _)| *key);
        out
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// The configuration this list runs with.
    pub fn config(&self) -> &PeerListConfig {
        &self.config
    }

    fn persist(&self, key: PeerKey, peer: &Peer) -> PeerResult<()> {
        let doc = serde_json::to_vec(peer)?;
        self.store
            .put(ColumnFamily::Peers, &key.to_be_bytes(), &doc)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nelson_store::Database;

    fn test_config() -> PeerListConfig {
        PeerListConfig {
            dns_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn test_list(config: PeerListConfig) -> PeerList {
        let store = Arc::new(Database::open_temporary().unwrap());
        PeerList::new(store, config)
    }

    #[tokio::test]
    async fn test_load_defaults_cold_start() {
        let list = test_list(test_config());
        list.load(&["node-a.example/18600/15600/14600".to_string()])
            .await
            .unwrap();

        assert_eq!(list.len(), 1);
        let (_, peer) = &list.all()[0];
        assert_eq!(peer.hostname, "node-a.example");
        assert_eq!(peer.port, 18600);
        assert!(peer.is_trusted);
        assert_eq!(peer.weight, 1.0);
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let list = test_list(test_config());
        let defaults = vec!["node-a.example/18600/15600/14600".to_string()];
        list.load(&defaults).await.unwrap();
        list.load(&defaults).await.unwrap();
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn test_load_skips_malformed_defaults() {
        let list = test_list(test_config());
        list.load(&["node-a.example/notaport".to_string()])
            .await
            .unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_add_then_find_reflects_ports() {
        let list = test_list(test_config());
        list.add("node-a.example", 16600, 15600, 14600, false, 0.5)
            .await
            .unwrap();

        let found = list.find_by_address("node-a.example", 16600).await;
        assert_eq!(found.len(), 1);
        let (_, peer) = &found[0];
        assert_eq!(peer.port, 16600);
        assert_eq!(peer.tcp_port, 15600);
        assert_eq!(peer.udp_port, 14600);
    }

    #[tokio::test]
    async fn test_add_raises_weight_only_upward() {
        let list = test_list(test_config());
        list.add("node-a.example", 16600, 15600, 14600, false, 0.3)
            .await
            .unwrap();
        list.add("node-a.example", 16600, 15600, 14600, false, 0.7)
            .await
            .unwrap();

        assert_eq!(list.len(), 1);
        assert_eq!(list.all()[0].1.weight, 0.7);

        // A lower weight does not lower the stored one
        list.add("node-a.example", 16600, 15600, 14600, false, 0.1)
            .await
            .unwrap();
        assert_eq!(list.all()[0].1.weight, 0.7);
    }

    #[tokio::test]
    async fn test_add_updates_ports_without_multi_port() {
        let list = test_list(test_config());
        list.add("node-a.example", 16600, 15600, 14600, false, 0.5)
            .await
            .unwrap();
        list.add("node-a.example", 17000, 15700, 14700, false, 0.5)
            .await
            .unwrap();

        assert_eq!(list.len(), 1);
        let (_, peer) = &list.all()[0];
        assert_eq!(peer.port, 17000);
        assert_eq!(peer.tcp_port, 15700);
        assert_eq!(peer.udp_port, 14700);
    }

    #[tokio::test]
    async fn test_multi_port_keeps_separate_peers() {
        let list = test_list(PeerListConfig {
            multi_port: true,
            ..test_config()
        });
        list.add("node-a.example", 16600, 15600, 14600, false, 0.5)
            .await
            .unwrap();
        list.add("node-a.example", 17000, 15700, 14700, false, 0.5)
            .await
            .unwrap();

        assert_eq!(list.len(), 2);
        let found = list.find_by_address("node-a.example", 17000).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.port, 17000);
    }

    #[tokio::test]
    async fn test_private_literal_normalized() {
        let list = test_list(test_config());
        list.add("::ffff:10.0.0.1", 16600, 15600, 14600, false, 0.5)
            .await
            .unwrap();
        assert_eq!(list.all()[0].1.hostname, "localhost");
    }

    #[tokio::test]
    async fn test_mark_connected_and_tried() {
        let list = test_list(test_config());
        let (key, _) = list
            .add("8.8.8.8", 16600, 15600, 14600, false, 1.0)
            .await
            .unwrap();

        list.mark_tried(key).unwrap();
        list.mark_tried(key).unwrap();
        assert_eq!(list.get(key).unwrap().tried, 2);

        let peer = list.mark_connected(key).unwrap();
        assert_eq!(peer.tried, 0);
        assert_eq!(peer.connected, 1);
        let last = peer.date_last_connected.unwrap();
        assert!(peer.date_created <= last);
    }

    #[tokio::test]
    async fn test_is_trusted_uri() {
        let list = test_list(test_config());
        list.load(&["8.8.8.8".to_string()]).await.unwrap();
        list.add("9.9.9.9", 16600, 15600, 14600, false, 1.0)
            .await
            .unwrap();

        assert!(list.is_trusted_uri("8.8.8.8").await);
        assert!(!list.is_trusted_uri("9.9.9.9").await);
        assert!(!list.is_trusted_uri("").await);
    }

    #[tokio::test]
    async fn test_clear() {
        let list = test_list(test_config());
        list.add("8.8.8.8", 16600, 15600, 14600, false, 1.0)
            .await
            .unwrap();
        list.clear().unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_reload_is_permutation() {
        let store = Arc::new(Database::open_temporary().unwrap());
        let list = PeerList::new(Arc::clone(&store) as Arc<dyn Store>, test_config());
        for host in ["8.8.8.8", "9.9.9.9", "1.1.1.1"] {
            list.add(host, 16600, 15600, 14600, false, 1.0)
                .await
                .unwrap();
        }
        let mut before: Vec<String> =
            list.all().into_iter().map(|(_, p)| p.hostname).collect();

        let reloaded = PeerList::new(store, test_config());
        reloaded.load(&[]).await.unwrap();
        let mut after: Vec<String> =
            reloaded.all().into_iter().map(|(_, p)| p.hostname).collect();

        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_get_weighted_bounds() {
        let list = test_list(test_config());
        for host in ["8.8.8.8", "9.9.9.9", "1.1.1.1"] {
            list.add(host, 16600, 15600, 14600, false, 1.0)
                .await
                .unwrap();
        }

        // 0 means all
        assert_eq!(list.get_weighted(0, None).len(), 3);

        // Bounded and distinct
        let sample = list.get_weighted(2, None);
        assert_eq!(sample.len(), 2);
        assert_ne!(sample[0].0, sample[1].0);

        // Over-asking returns the whole pool
        assert_eq!(list.get_weighted(10, None).len(), 3);
    }

    #[tokio::test]
    async fn test_get_weighted_trusted_ratio() {
        let list = test_list(test_config());
        list.add("8.8.8.8", 16600, 15600, 14600, true, 1.0)
            .await
            .unwrap();
        list.add("9.9.9.9", 16600, 15600, 14600, false, 1.0)
            .await
            .unwrap();

        for (_, peer, ratio) in list.get_weighted(0, None) {
            if peer.is_trusted {
                assert_eq!(ratio, 1.0);
            } else {
                assert!(ratio > 0.0 && ratio <= 1.0);
            }
        }
    }
}
