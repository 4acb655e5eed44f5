//! Live-link table.
//!
//! Tracks every in-flight link session and enforces the one-link-per-peer
//! rule. Mutated only from the node's event loop.

use nelson_network::{LinkHandle, LinkId, LinkState};
use nelson_peers::PeerKey;
use std::collections::HashMap;

/// One tracked link session.
pub struct LinkEntry {
    /// The peer this link belongs to. `None` for an inbound link whose
    /// hello has not arrived yet.
    pub key: Option<PeerKey>,
    /// Session state.
    pub state: LinkState,
    /// Writer half; dropping it evicts the session.
    pub handle: LinkHandle,
}

/// Result of binding a link to a peer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyOutcome {
    /// The link is now bound to the peer.
    Identified,
    /// The link was already bound (outbound links are bound at dial time).
    AlreadyIdentified,
    /// Another link already serves this peer; the caller closes this one.
    AlreadyLinked,
    /// No such link (already removed).
    UnknownLink,
}

/// The set of live links, keyed by link id with a per-peer index.
#[derive(Default)]
pub struct LinkTable {
    entries: HashMap<LinkId, LinkEntry>,
    by_peer: HashMap<PeerKey, LinkId>,
    last_id: LinkId,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next link id.
    pub fn next_id(&mut self) -> LinkId {
        self.last_id += 1;
        self.last_id
    }

    /// Track an outbound link. The peer is known at dial time and holds
    /// its table slot while the dial is in flight.
    pub fn insert_outbound(&mut self, id: LinkId, key: PeerKey, handle: LinkHandle) {
        self.by_peer.insert(key, id);
        self.entries.insert(
            id,
            LinkEntry {
                key: Some(key),
                state: LinkState::Dialing,
                handle,
            },
        );
    }

    /// Track an accepted link. The peer is unknown until its hello.
    pub fn insert_incoming(&mut self, id: LinkId, handle: LinkHandle) {
        self.entries.insert(
            id,
            LinkEntry {
                key: None,
                state: LinkState::Open,
                handle,
            },
        );
    }

    /// Transition a link to open.
    pub fn mark_open(&mut self, id: LinkId) -> Option<&LinkEntry> {
        let entry = self.entries.get_mut(&id)?;
        entry.state = LinkState::Open;
        Some(entry)
    }

    /// Bind a link to a peer identity, refusing a second link per peer.
    pub fn identify(&mut self, id: LinkId, key: PeerKey) -> IdentifyOutcome {
        let Some(entry) = self.entries.get_mut(&id) else {
            return IdentifyOutcome::UnknownLink;
        };
        if entry.key.is_some() {
            return IdentifyOutcome::AlreadyIdentified;
        }
        if self.by_peer.contains_key(&key) {
            return IdentifyOutcome::AlreadyLinked;
        }
        entry.key = Some(key);
        self.by_peer.insert(key, id);
        IdentifyOutcome::Identified
    }

    /// Drop a link from the table, returning its entry.
    pub fn remove(&mut self, id: LinkId) -> Option<LinkEntry> {
        let entry = self.entries.remove(&id)?;
        if let Some(key) = entry.key {
            if self.by_peer.get(&key) == Some(&id) {
                self.by_peer.remove(&key);
            }
        }
        Some(entry)
    }

    pub fn get(&self, id: LinkId) -> Option<&LinkEntry> {
        self.entries.get(&id)
    }

    /// Whether a peer already has a link (open or dialing).
    pub fn has_peer(&self, key: PeerKey) -> bool {
        self.by_peer.contains_key(&key)
    }

    /// Total tracked links, dialing included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All tracked link ids.
    pub fn ids(&self) -> Vec<LinkId> {
        self.entries.keys().copied().collect()
    }

    /// Entries in the open state.
    pub fn open_entries(&self) -> impl Iterator<Item = &LinkEntry> {
        self.entries
            .values()
            .filter(|e| e.state == LinkState::Open)
    }

    /// Open links that are bound to a peer.
    pub fn open_keyed(&self) -> Vec<(LinkId, PeerKey)> {
        let mut out: Vec<(LinkId, PeerKey)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == LinkState::Open)
            .filter_map(|(id, e)| e.key.map(|k| (*id, k)))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Peers behind open links.
    pub fn open_keys(&self) -> Vec<PeerKey> {
        self.open_keyed().into_iter().map(|(_, k)| k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nelson_network::{open_link, Hello, LinkConfig, LinkEvent, PeerAdvert};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn held_listener() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn test_hello() -> Hello {
        Hello {
            identity: PeerAdvert {
                hostname: String::new(),
                port: 16600,
                tcp_port: 15600,
                udp_port: 14600,
                is_trusted: false,
                weight: 1.0,
            },
            peers: Vec::new(),
        }
    }

    fn spawn_handle(
        table: &mut LinkTable,
        addr: std::net::SocketAddr,
        events: &mpsc::Sender<LinkEvent>,
    ) -> LinkId {
        let id = table.next_id();
        let handle = open_link(id, addr, test_hello(), LinkConfig::default(), events.clone());
        table.insert_outbound(id, id, handle);
        id
    }

    #[tokio::test]
    async fn test_one_link_per_peer() {
        let (_listener, addr) = held_listener().await;
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut table = LinkTable::new();

        let outbound = table.next_id();
        let handle = open_link(
            outbound,
            addr,
            test_hello(),
            LinkConfig::default(),
            events_tx.clone(),
        );
        table.insert_outbound(outbound, 42, handle);
        assert!(table.has_peer(42));

        // A second (inbound) link claiming the same peer is refused.
        let inbound = table.next_id();
        let handle = open_link(
            inbound,
            addr,
            test_hello(),
            LinkConfig::default(),
            events_tx.clone(),
        );
        table.insert_incoming(inbound, handle);
        assert_eq!(table.identify(inbound, 42), IdentifyOutcome::AlreadyLinked);

        // A different peer binds fine.
        assert_eq!(table.identify(inbound, 43), IdentifyOutcome::Identified);
        assert_eq!(table.identify(inbound, 44), IdentifyOutcome::AlreadyIdentified);
    }

    #[tokio::test]
    async fn test_open_tracking_and_removal() {
        let (_listener, addr) = held_listener().await;
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut table = LinkTable::new();

        assert!(table.is_empty());
        let a = spawn_handle(&mut table, addr, &events_tx);
        let b = spawn_handle(&mut table, addr, &events_tx);
        assert_eq!(table.len(), 2);

        // Dialing links are not open yet
        assert!(table.open_keyed().is_empty());

        table.mark_open(a);
        assert_eq!(table.open_keyed().len(), 1);
        assert_eq!(table.open_keys(), vec![a]);

        let removed = table.remove(a).unwrap();
        assert_eq!(removed.key, Some(a));
        assert!(!table.has_peer(a));
        assert_eq!(table.len(), 1);

        assert!(table.remove(a).is_none());
        assert!(table.get(b).is_some());
    }
}
