//! JSON command client for the backing ledger process.

use crate::{IriError, IriResult};
use nelson_peers::{resolve_host, Peer};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ledger client configuration.
#[derive(Debug, Clone)]
pub struct IriConfig {
    /// Ledger RPC host.
    pub hostname: String,
    /// Ledger RPC port.
    pub port: u16,
    /// Make `update_neighbors` spare static neighbors during its removal
    /// phase. Off by default: the unfiltered removal is the historical
    /// behavior.
    pub preserve_static: bool,
    /// Startup poll period.
    pub poll_interval: Duration,
    /// Health ticker period.
    pub health_interval: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// DNS timeout when resolving static neighbors.
    pub dns_timeout: Duration,
}

impl Default for IriConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 14265,
            preserve_static: false,
            poll_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            dns_timeout: Duration::from_secs(5),
        }
    }
}

/// Events emitted by the health ticker.
#[derive(Debug, Clone)]
pub enum IriEvent {
    /// Result of a health probe. `neighbors` carries the reported neighbor
    /// addresses on success.
    Health {
        healthy: bool,
        neighbors: Option<Vec<String>>,
    },
}

/// A neighbor as reported by the ledger.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IriNeighbor {
    /// `host:port`.
    pub address: String,
    /// `tcp` or `udp`.
    pub connection_type: String,
}

impl IriNeighbor {
    /// The URI form the ledger accepts in removal requests.
    pub fn uri(&self) -> String {
        format!("{}://{}", self.connection_type, self.address)
    }

    /// Host part of the address.
    pub fn host(&self) -> &str {
        self.address.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.address)
    }
}

#[derive(Deserialize)]
struct GetNeighborsResponse {
    neighbors: Vec<IriNeighbor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddNeighborsResponse {
    added_neighbors: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveNeighborsResponse {
    removed_neighbors: u64,
}

/// A neighbor hard-coded into the ledger before this daemon started.
///
/// Recorded once on `start()`, read-only afterwards, and never removed
/// through the managed surface.
#[derive(Debug, Clone)]
pub struct StaticNeighbor {
    pub hostname: String,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
}

/// Client for the ledger's JSON command API.
pub struct IriClient {
    config: IriConfig,
    http: reqwest::Client,
    base_url: String,
    started: AtomicBool,
    healthy: AtomicBool,
    static_neighbors: RwLock<Vec<StaticNeighbor>>,
    event_tx: mpsc::Sender<IriEvent>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl IriClient {
    /// Create a client. Health probe results arrive on the returned
    /// receiver once [`IriClient::start`] has completed.
    pub fn new(config: IriConfig) -> (Self, mpsc::Receiver<IriEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("http client");
        let base_url = format!("http://{}:{}", config.hostname, config.port);

        let client = Self {
            config,
            http,
            base_url,
            started: AtomicBool::new(false),
            healthy: AtomicBool::new(false),
            static_neighbors: RwLock::new(Vec::new()),
            event_tx,
            ticker: Mutex::new(None),
        };

        (client, event_rx)
    }

    /// Poll `getNeighbors` until the ledger answers, record its
    /// currently-configured neighbors as static, then begin the health
    /// ticker. Resolves only after the first successful response.
    pub async fn start(self: &Arc<Self>) -> Vec<IriNeighbor> {
        let neighbors = loop {
            match self.get_neighbors().await {
                Ok(neighbors) => break neighbors,
                Err(e) => {
                    warn!(url = %self.base_url, error = %e, "Ledger not reachable yet, retrying");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        };

        let mut statics = Vec::with_capacity(neighbors.len());
        for neighbor in &neighbors {
            let host = neighbor.host().to_string();
            let ip = match host.parse::<IpAddr>() {
                Ok(literal) => Some(literal),
                Err(_) => resolve_host(&host, self.config.dns_timeout).await,
            };
            let port = neighbor
                .address
                .rsplit_once(':')
                .and_then(|(_, p)| p.parse().ok());
            statics.push(StaticNeighbor {
                hostname: host,
                ip,
                port,
            });
        }

        info!(
            count = statics.len(),
            "Ledger reachable, recorded static neighbors"
        );
        *self.static_neighbors.write() = statics;
        self.started.store(true, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);

        self.spawn_ticker();

        neighbors
    }

    fn spawn_ticker(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(client.config.health_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so probes start
            // one period after start().
            interval.tick().await;

            loop {
                interval.tick().await;
                match client.get_neighbors().await {
                    Ok(neighbors) => {
                        client.healthy.store(true, Ordering::SeqCst);
                        let addresses =
                            neighbors.iter().map(|n| n.address.clone()).collect();
                        let _ = client
                            .event_tx
                            .send(IriEvent::Health {
                                healthy: true,
                                neighbors: Some(addresses),
                            })
                            .await;
                    }
                    Err(e) => {
                        debug!(error = %e, "Ledger health probe failed");
                        client.healthy.store(false, Ordering::SeqCst);
                        let _ = client
                            .event_tx
                            .send(IriEvent::Health {
                                healthy: false,
                                neighbors: None,
                            })
                            .await;
                    }
                }
            }
        });

        let mut ticker = self.ticker.lock();
        if let Some(old) = ticker.replace(handle) {
            old.abort();
        }
    }

    /// Stop the health ticker. `start()` may be called again.
    pub fn end(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        self.started.store(false, Ordering::SeqCst);
    }

    /// Whether the last probe (or startup) saw a responsive ledger.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Whether `start()` has completed.
    pub fn is_available(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// The recorded static neighbors.
    pub fn static_neighbors(&self) -> Vec<StaticNeighbor> {
        self.static_neighbors.read().clone()
    }

    /// Membership test against the static set, by IP or hostname.
    pub fn is_static_neighbor(&self, peer: &Peer) -> bool {
        self.static_neighbors.read().iter().any(|s| {
            s.hostname == peer.hostname
                || (peer.ip.is_some() && s.ip == peer.ip)
                || peer
                    .ip
                    .map(|ip| s.hostname.parse::<IpAddr>() == Ok(ip))
                    .unwrap_or(false)
        })
    }

    fn is_static_address(&self, host: &str) -> bool {
        self.static_neighbors.read().iter().any(|s| {
            s.hostname == host || s.ip.map(|ip| ip.to_string() == host).unwrap_or(false)
        })
    }

    /// Fetch the ledger's current neighbor list.
    pub async fn get_neighbors(&self) -> IriResult<Vec<IriNeighbor>> {
        let response: GetNeighborsResponse = self
            .command(serde_json::json!({"command": "getNeighbors"}))
            .await?;
        Ok(response.neighbors)
    }

    /// Advertise peers to the ledger as UDP neighbors.
    pub async fn add_neighbors(&self, peers: &[Peer]) -> IriResult<u64> {
        if !self.is_available() {
            return Err(IriError::NotAvailable);
        }
        if peers.is_empty() {
            return Ok(0);
        }

        let uris: Vec<String> = peers.iter().map(|p| p.udp_uri()).collect();
        debug!(count = uris.len(), "Adding ledger neighbors");
        let response: AddNeighborsResponse = self
            .command(serde_json::json!({"command": "addNeighbors", "uris": uris}))
            .await?;
        Ok(response.added_neighbors)
    }

    /// Withdraw peers from the ledger. Static neighbors are skipped with a
    /// warning.
    pub async fn remove_neighbors(&self, peers: &[Peer]) -> IriResult<u64> {
        if !self.is_available() {
            return Err(IriError::NotAvailable);
        }

        let uris: Vec<String> = peers
            .iter()
            .filter(|p| {
                if self.is_static_neighbor(p) {
                    warn!(hostname = %p.hostname, "Refusing to remove static neighbor");
                    false
                } else {
                    true
                }
            })
            .map(|p| p.udp_uri())
            .collect();

        self.remove_uris(uris).await
    }

    /// Replace the ledger's neighbor set with `peers`.
    ///
    /// The removal phase covers every currently-configured neighbor,
    /// static ones included, unless `preserve_static` is set. Not atomic
    /// across the two RPCs.
    pub async fn update_neighbors(&self, peers: &[Peer]) -> IriResult<()> {
        if !self.is_available() {
            return Err(IriError::NotAvailable);
        }

        let current = self.get_neighbors().await?;
        let uris: Vec<String> = current
            .iter()
            .filter(|n| !self.config.preserve_static || !self.is_static_address(n.host()))
            .map(|n| n.uri())
            .collect();

        self.remove_uris(uris).await?;
        self.add_neighbors(peers).await?;
        Ok(())
    }

    /// Withdraw every currently-configured neighbor except static ones.
    pub async fn remove_all_neighbors(&self) -> IriResult<u64> {
        if !self.is_available() {
            return Err(IriError::NotAvailable);
        }

        let current = self.get_neighbors().await?;
        let uris: Vec<String> = current
            .iter()
            .filter(|n| {
                if self.is_static_address(n.host()) {
                    warn!(address = %n.address, "Refusing to remove static neighbor");
                    false
                } else {
                    true
                }
            })
            .map(|n| n.uri())
            .collect();

        self.remove_uris(uris).await
    }

    async fn remove_uris(&self, uris: Vec<String>) -> IriResult<u64> {
        if uris.is_empty() {
            return Ok(0);
        }
        debug!(count = uris.len(), "Removing ledger neighbors");
        let response: RemoveNeighborsResponse = self
            .command(serde_json::json!({"command": "removeNeighbors", "uris": uris}))
            .await?;
        Ok(response.removed_neighbors)
    }

    async fn command<T: DeserializeOwned>(&self, body: serde_json::Value) -> IriResult<T> {
        let response = self
            .http
            .post(&self.base_url)
            .header("X-IOTA-API-Version", "1")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(IriError::Rpc {
                status: status.as_u16(),
                detail,
            });
        }

        Ok(response.json::<T>().await?)
    }
}
