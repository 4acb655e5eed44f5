//! Node implementation: wires the peer list, scheduler, ledger client and
//! link sessions together and enforces the global invariants.

use crate::config::NodeConfig;
use crate::links::{IdentifyOutcome, LinkTable};
use anyhow::{Context, Result};
use blake2::{Blake2b, Digest};
use nelson_api::AppState;
use nelson_heart::{Heart, HeartCommand, HeartEvent, HeartMonitor};
use nelson_iri::{IriClient, IriEvent};
use nelson_network::{
    accept_link, open_link, CloseReason, Hello, LinkEvent, LinkId, LinkState, Message, PeerAdvert,
};
use nelson_peers::{resolve_host, Peer, PeerKey, PeerList};
use nelson_store::{Database, Store};
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Tie-break rank for cycle eviction, derived from the epoch personality
/// so the churn pattern changes each epoch.
fn churn_rank(personality: &str, peer: &Peer) -> u64 {
    let mut hasher = Blake2b::<typenum::U32>::new();
    hasher.update(personality.as_bytes());
    hasher.update(peer.hostname.as_bytes());
    hasher.update(peer.port.to_be_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[0..8]);
    u64::from_be_bytes(bytes)
}

struct Channels {
    heart: Heart,
    heart_events: mpsc::Receiver<HeartEvent>,
    iri_events: mpsc::Receiver<IriEvent>,
}

/// The daemon, coordinating all components.
pub struct Node {
    config: NodeConfig,
    peers: Arc<PeerList>,
    iri: Arc<IriClient>,
    api_state: AppState,
    heart_monitor: HeartMonitor,
    /// Identities of peers behind open links, shared with the status API.
    connected: Arc<RwLock<Vec<Peer>>>,
    heart_commands: mpsc::Sender<HeartCommand>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    channels: Mutex<Option<Channels>>,
}

impl Node {
    /// Create a new node. Fails if the persistent store cannot be opened.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        let store: Arc<dyn Store> = if config.temporary {
            Arc::new(Database::open_temporary()?)
        } else {
            if let Some(parent) = config.data_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Arc::new(Database::open(&config.data_path)?)
        };

        let peers = Arc::new(PeerList::new(store, config.peer_list_config()));
        let (iri, iri_events) = IriClient::new(config.iri_config());
        let iri = Arc::new(iri);
        let (heart, heart_events, heart_commands) = Heart::new(config.heart_config());
        let heart_monitor = heart.monitor();
        let connected = Arc::new(RwLock::new(Vec::new()));

        let api_state = AppState::new(
            Arc::clone(&peers),
            Arc::clone(&iri),
            heart_monitor.clone(),
            Arc::clone(&connected),
            config.echo(),
        );

        Ok(Arc::new(Self {
            config,
            peers,
            iri,
            api_state,
            heart_monitor,
            connected,
            heart_commands,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            channels: Mutex::new(Some(Channels {
                heart,
                heart_events,
                iri_events,
            })),
        }))
    }

    /// Run the node: load peers, start the API, wait for the ledger, then
    /// drive the event loop until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let Channels {
            mut heart,
            heart_events,
            iri_events,
        } = self
            .channels
            .lock()
            .take()
            .context("node is already running")?;

        self.peers.load(&self.config.neighbors).await?;
        self.start_api().await?;

        info!(
            host = %self.config.iri_hostname,
            port = self.config.iri_port,
            "Waiting for ledger"
        );
        self.iri.start().await;

        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        info!(port = self.config.port, "Peer link listener bound");

        tokio::spawn(async move { heart.run().await });
        self.api_state.set_ready(true);

        self.event_loop(listener, heart_events, iri_events).await;

        info!("Node event loop stopped");
        Ok(())
    }

    /// Stop timers, withdraw managed neighbors and go quiescent.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();

        let _ = self.heart_commands.send(HeartCommand::Stop).await;
        if self.iri.is_available() {
            if let Err(e) = self.iri.remove_all_neighbors().await {
                warn!(error = %e, "Failed to withdraw neighbors on shutdown");
            }
        }
        self.iri.end();
    }

    async fn start_api(&self) -> Result<()> {
        let router = nelson_api::build_api(self.api_state.clone());
        let listener = TcpListener::bind((
            self.config.api_hostname.as_str(),
            self.config.api_port,
        ))
        .await?;
        info!(
            host = %self.config.api_hostname,
            port = self.config.api_port,
            "Status API listening"
        );

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "Status API error");
            }
        });
        Ok(())
    }

    async fn event_loop(
        &self,
        listener: TcpListener,
        mut heart_events: mpsc::Receiver<HeartEvent>,
        mut iri_events: mpsc::Receiver<IriEvent>,
    ) {
        let (link_tx, mut link_events) = mpsc::channel::<LinkEvent>(256);
        let mut table = LinkTable::new();
        let mut ledger_healthy = true;

        // Initial population mirrors an epoch tick.
        self.full_reshuffle(&mut table, &link_tx).await;

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.shutdown_notify.notified() => break,

                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        self.handle_accept(&mut table, &link_tx, stream, addr);
                    }
                    Err(e) => warn!(error = %e, "Accept error"),
                },

                Some(event) = heart_events.recv() => match event {
                    HeartEvent::Beat { .. } => self.on_beat(&mut table, &link_tx).await,
                    HeartEvent::Cycle { number } => {
                        self.on_cycle(&mut table, &link_tx, number).await;
                    }
                    HeartEvent::Epoch { number, .. } => {
                        info!(epoch = number, "Epoch reshuffle");
                        self.full_reshuffle(&mut table, &link_tx).await;
                    }
                },

                Some(event) = link_events.recv() => {
                    self.on_link_event(&mut table, event).await;
                }

                Some(event) = iri_events.recv() => match event {
                    IriEvent::Health { healthy, .. } => {
                        if healthy && !ledger_healthy {
                            info!("Ledger healthy again, resyncing neighbors");
                            self.full_reshuffle(&mut table, &link_tx).await;
                        }
                        ledger_healthy = healthy;
                    }
                },
            }
        }
    }

    /// The hello this node sends on every link: its own advertised ports
    /// plus a weighted gossip sample.
    fn local_hello(&self) -> Hello {
        let gossip = self
            .peers
            .get_weighted(self.config.gossip_size, None)
            .into_iter()
            .map(|(_, peer, ratio)| PeerAdvert::from_peer(&peer, ratio))
            .collect();

        Hello {
            // Hostname left empty; the receiver falls back to the socket
            // address it sees.
            identity: PeerAdvert {
                hostname: String::new(),
                port: self.config.port,
                tcp_port: self.config.tcp_port,
                udp_port: self.config.udp_port,
                is_trusted: false,
                weight: 1.0,
            },
            peers: gossip,
        }
    }

    fn handle_accept(
        &self,
        table: &mut LinkTable,
        link_tx: &mpsc::Sender<LinkEvent>,
        stream: TcpStream,
        addr: SocketAddr,
    ) {
        if table.len() >= self.config.max_links * 2 {
            warn!(addr = %addr, "Link capacity reached, rejecting");
            return;
        }

        info!(addr = %addr, "Incoming link");
        let id = table.next_id();
        let handle = accept_link(
            id,
            stream,
            addr,
            self.local_hello(),
            self.config.link_config(),
            link_tx.clone(),
        );
        table.insert_incoming(id, handle);
    }

    async fn on_beat(&self, table: &mut LinkTable, link_tx: &mpsc::Sender<LinkEvent>) {
        for entry in table.open_entries() {
            entry.handle.send(Message::Beat).await;
        }
        // Links closed since the last beat get their replacement here.
        self.fill_links(table, link_tx).await;
    }

    async fn on_cycle(
        &self,
        table: &mut LinkTable,
        link_tx: &mpsc::Sender<LinkEvent>,
        number: u64,
    ) {
        info!(cycle = number, "Cycle reshuffle");
        let personality = self.heart_monitor.snapshot().personality;

        // Rank open links worst-first: lowest effective weight, personality
        // hash as tie-breaker.
        let mut ranked: Vec<(LinkId, f64, u64)> = table
            .open_keyed()
            .into_iter()
            .filter_map(|(id, key)| {
                self.peers
                    .get(key)
                    .map(|p| (id, self.peers.peer_weight(&p), churn_rank(&personality, &p)))
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
        });

        let evict = (ranked.len() + 2) / 3;
        for (id, _, _) in ranked.into_iter().take(evict) {
            self.close_link(table, id, "cycle eviction").await;
        }

        // Fresh gossip rides on the cycle: each surviving link gets a new
        // weighted sample.
        let sample: Vec<PeerAdvert> = self
            .peers
            .get_weighted(self.config.gossip_size, None)
            .into_iter()
            .map(|(_, peer, ratio)| PeerAdvert::from_peer(&peer, ratio))
            .collect();
        if !sample.is_empty() {
            for entry in table.open_entries() {
                entry.handle.send(Message::Peers(sample.clone())).await;
            }
        }

        self.fill_links(table, link_tx).await;
        self.refresh_connected(table);
    }

    /// Full reshuffle: drop every non-trusted link, repopulate from the
    /// weighted sample, and mirror the open set to the ledger.
    async fn full_reshuffle(&self, table: &mut LinkTable, link_tx: &mpsc::Sender<LinkEvent>) {
        let to_close: Vec<LinkId> = table
            .ids()
            .into_iter()
            .filter(|id| {
                match table
                    .get(*id)
                    .and_then(|e| e.key)
                    .and_then(|k| self.peers.get(k))
                {
                    Some(peer) => !peer.is_trusted,
                    // Unidentified inbound links don't survive an epoch
                    None => true,
                }
            })
            .collect();
        for id in to_close {
            self.close_link(table, id, "epoch eviction").await;
        }

        self.fill_links(table, link_tx).await;
        self.refresh_connected(table);

        if self.iri.is_available() {
            let advertised: Vec<Peer> = self
                .open_peers(table)
                .into_iter()
                .filter(|p| !self.iri.is_static_neighbor(p))
                .collect();
            if let Err(e) = self.iri.update_neighbors(&advertised).await {
                warn!(error = %e, "Ledger neighbor resync failed");
            }
        }
    }

    /// Dial weighted-sampled peers until the link target is met.
    async fn fill_links(&self, table: &mut LinkTable, link_tx: &mpsc::Sender<LinkEvent>) {
        let deficit = self.config.max_links.saturating_sub(table.len());
        if deficit == 0 {
            return;
        }

        let mut opened = 0;
        for (key, peer, _) in self.peers.get_weighted(0, None) {
            if opened >= deficit {
                break;
            }
            if table.has_peer(key) {
                continue;
            }
            if self.open_link_to(table, link_tx, key, &peer).await {
                opened += 1;
            }
        }
    }

    /// Start a dial. Returns false when the peer has no usable address.
    async fn open_link_to(
        &self,
        table: &mut LinkTable,
        link_tx: &mpsc::Sender<LinkEvent>,
        key: PeerKey,
        peer: &Peer,
    ) -> bool {
        let Some(addr) = self.peer_addr(peer).await else {
            debug!(hostname = %peer.hostname, "Peer has no resolvable address");
            let _ = self.peers.mark_tried(key);
            return false;
        };

        let id = table.next_id();
        debug!(link = id, hostname = %peer.hostname, addr = %addr, "Dialing peer");
        let handle = open_link(
            id,
            addr,
            self.local_hello(),
            self.config.link_config(),
            link_tx.clone(),
        );
        table.insert_outbound(id, key, handle);
        true
    }

    async fn peer_addr(&self, peer: &Peer) -> Option<SocketAddr> {
        if let Some(ip) = peer.ip {
            return Some(SocketAddr::new(ip, peer.port));
        }
        if let Ok(ip) = peer.hostname.parse::<IpAddr>() {
            return Some(SocketAddr::new(ip, peer.port));
        }
        resolve_host(&peer.hostname, Duration::from_secs(5))
            .await
            .map(|ip| SocketAddr::new(ip, peer.port))
    }

    async fn on_link_event(&self, table: &mut LinkTable, event: LinkEvent) {
        match event {
            LinkEvent::Opened { id, addr } => {
                let Some(entry) = table.mark_open(id) else {
                    return;
                };
                info!(link = id, addr = %addr, "Link open");
                if let Some(key) = entry.key {
                    if let Err(e) = self.peers.mark_connected(key) {
                        warn!(error = %e, "Failed to record connection");
                    }
                    self.advertise_peer(key).await;
                }
                self.refresh_connected(table);
            }

            LinkEvent::Hello { id, addr, hello } => {
                self.on_hello(table, id, addr, hello).await;
            }

            LinkEvent::Peers { peers, .. } => {
                self.absorb_gossip(&peers).await;
            }

            LinkEvent::Closed { id, reason } => {
                // Links we evicted are already gone from the table.
                let Some(entry) = table.remove(id) else {
                    return;
                };
                debug!(link = id, reason = ?reason, "Link closed");

                if let Some(key) = entry.key {
                    if reason != CloseReason::Evicted {
                        if let Err(e) = self.peers.mark_tried(key) {
                            warn!(error = %e, "Failed to record attempt");
                        }
                    }
                    if entry.state == LinkState::Open {
                        self.withdraw_peer(key).await;
                    }
                }
                self.refresh_connected(table);
                // Replacement is decided on the next beat via fill_links.
            }
        }
    }

    async fn on_hello(&self, table: &mut LinkTable, id: LinkId, addr: SocketAddr, hello: Hello) {
        let identity = &hello.identity;
        let hostname = if identity.hostname.is_empty() {
            addr.ip().to_string()
        } else {
            identity.hostname.clone()
        };

        // Trust is never taken from the wire; the advertised bit only
        // describes the sender's own view.
        match self
            .peers
            .add(
                &hostname,
                identity.port,
                identity.tcp_port,
                identity.udp_port,
                false,
                1.0,
            )
            .await
        {
            Ok((key, peer)) => match table.identify(id, key) {
                IdentifyOutcome::Identified => {
                    info!(link = id, hostname = %peer.hostname, "Link identified");
                    if let Err(e) = self.peers.mark_connected(key) {
                        warn!(error = %e, "Failed to record connection");
                    }
                    self.advertise_peer(key).await;
                    self.refresh_connected(table);
                }
                IdentifyOutcome::AlreadyLinked => {
                    info!(link = id, hostname = %peer.hostname, "Peer already linked, closing duplicate");
                    self.close_link(table, id, "duplicate").await;
                }
                IdentifyOutcome::AlreadyIdentified | IdentifyOutcome::UnknownLink => {}
            },
            Err(e) => warn!(hostname = %hostname, error = %e, "Failed to add advertised peer"),
        }

        self.absorb_gossip(&hello.peers).await;
    }

    async fn absorb_gossip(&self, adverts: &[PeerAdvert]) {
        for advert in adverts.iter().take(self.config.gossip_size) {
            if advert.hostname.is_empty() {
                continue;
            }
            let weight = advert.weight.clamp(0.0, 1.0);
            if let Err(e) = self
                .peers
                .add(
                    &advert.hostname,
                    advert.port,
                    advert.tcp_port,
                    advert.udp_port,
                    false,
                    weight,
                )
                .await
            {
                debug!(hostname = %advert.hostname, error = %e, "Gossip add failed");
            }
        }
    }

    /// Evict a link: remove it from the table and withdraw its peer from
    /// the ledger. Dropping the handle ends the session task.
    async fn close_link(&self, table: &mut LinkTable, id: LinkId, why: &str) {
        let Some(entry) = table.remove(id) else {
            return;
        };
        debug!(link = id, why, "Evicting link");

        if entry.state == LinkState::Open {
            if let Some(key) = entry.key {
                self.withdraw_peer(key).await;
            }
        }
    }

    async fn advertise_peer(&self, key: PeerKey) {
        let Some(peer) = self.peers.get(key) else {
            return;
        };
        if self.iri.is_static_neighbor(&peer) || !self.iri.is_available() {
            return;
        }
        if let Err(e) = self.iri.add_neighbors(&[peer]).await {
            debug!(error = %e, "Neighbor add failed");
        }
    }

    async fn withdraw_peer(&self, key: PeerKey) {
        let Some(peer) = self.peers.get(key) else {
            return;
        };
        if self.iri.is_static_neighbor(&peer) || !self.iri.is_available() {
            return;
        }
        if let Err(e) = self.iri.remove_neighbors(&[peer]).await {
            debug!(error = %e, "Neighbor removal failed");
        }
    }

    fn open_peers(&self, table: &LinkTable) -> Vec<Peer> {
        table
            .open_keys()
            .into_iter()
            .filter_map(|key| self.peers.get(key))
            .collect()
    }

    fn refresh_connected(&self, table: &LinkTable) {
        *self.connected.write() = self.open_peers(table);
    }
}
