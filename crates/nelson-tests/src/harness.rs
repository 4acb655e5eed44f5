//! Test harness for integration tests.
//!
//! Provides throwaway stores, a hashmap-backed store for cheap property
//! tests, and an in-process ledger stub speaking the command API.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use nelson_iri::IriConfig;
use nelson_peers::{Peer, PeerList, PeerListConfig};
use nelson_store::{ColumnFamily, Database, Store, StoreResult};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Test store backed by a throwaway directory, removed on drop.
pub struct TestStore {
    db: Database,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            db: Database::open_temporary().expect("Failed to open temporary store"),
        }
    }

    /// Shareable handle to the same underlying database.
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::new(self.db.clone())
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory store for tests that churn through many instances.
#[derive(Default)]
pub struct MemoryStore {
    cfs: Mutex<HashMap<&'static str, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl Store for MemoryStore {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .cfs
            .lock()
            .get(cf.name())
            .and_then(|m| m.get(key).cloned()))
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.cfs
            .lock()
            .entry(cf.name())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StoreResult<()> {
        if let Some(m) = self.cfs.lock().get_mut(cf.name()) {
            m.remove(key);
        }
        Ok(())
    }

    fn iter(&self, cf: ColumnFamily) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .cfs
            .lock()
            .get(cf.name())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn clear(&self, cf: ColumnFamily) -> StoreResult<()> {
        self.cfs.lock().remove(cf.name());
        Ok(())
    }
}

/// Peer list over a fresh in-memory store, with a short DNS timeout.
pub fn memory_peer_list(config: PeerListConfig) -> PeerList {
    let config = PeerListConfig {
        dns_timeout: Duration::from_millis(500),
        ..config
    };
    PeerList::new(Arc::new(MemoryStore::default()), config)
}

/// A peer whose creation (and optionally last connection) lies in the past.
pub fn backdated_peer(hostname: &str, weight: f64, age: Duration) -> Peer {
    let mut peer = Peer::new(hostname.to_string(), None, 16600, 15600, 14600, false, weight);
    peer.date_created = peer.date_created.saturating_sub(age.as_millis() as u64);
    peer
}

/// Recorded state of the in-process ledger stub.
#[derive(Default)]
pub struct IriStubState {
    /// Number of leading `getNeighbors` calls answered with 503.
    pub fail_first: AtomicU32,
    /// Total `getNeighbors` calls seen.
    pub get_calls: AtomicU32,
    /// Current neighbor set as `(connectionType, address)`.
    pub neighbors: Mutex<Vec<(String, String)>>,
    /// Every `addNeighbors` payload, in arrival order.
    pub added: Mutex<Vec<Vec<String>>>,
    /// Every `removeNeighbors` payload, in arrival order.
    pub removed: Mutex<Vec<Vec<String>>>,
}

/// In-process ledger speaking the command API.
pub struct IriStub {
    pub addr: SocketAddr,
    pub state: Arc<IriStubState>,
}

impl IriStub {
    /// Start a stub that fails the first `fail_first` polls and then
    /// reports the given neighbors.
    pub async fn start(fail_first: u32, neighbors: &[(&str, &str)]) -> Self {
        let state = Arc::new(IriStubState {
            fail_first: AtomicU32::new(fail_first),
            ..Default::default()
        });
        *state.neighbors.lock() = neighbors
            .iter()
            .map(|(t, a)| (t.to_string(), a.to_string()))
            .collect();

        let app = Router::new()
            .route("/", post(handle_command))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state }
    }

    /// Client settings pointed at this stub, with test-friendly periods.
    pub fn iri_config(&self) -> IriConfig {
        IriConfig {
            hostname: self.addr.ip().to_string(),
            port: self.addr.port(),
            poll_interval: Duration::from_millis(50),
            health_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(2),
            dns_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }
}

async fn handle_command(
    State(state): State<Arc<IriStubState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let uris = || -> Vec<String> {
        body["uris"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    };

    match body["command"].as_str() {
        Some("getNeighbors") => {
            let calls = state.get_calls.fetch_add(1, Ordering::SeqCst);
            if calls < state.fail_first.load(Ordering::SeqCst) {
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
            let neighbors: Vec<Value> = state
                .neighbors
                .lock()
                .iter()
                .map(|(t, a)| json!({"address": a, "connectionType": t}))
                .collect();
            Ok(Json(json!({ "neighbors": neighbors })))
        }

        Some("addNeighbors") => {
            let uris = uris();
            let mut neighbors = state.neighbors.lock();
            for uri in &uris {
                if let Some((scheme, rest)) = uri.split_once("://") {
                    neighbors.push((scheme.to_string(), rest.to_string()));
                }
            }
            drop(neighbors);
            let count = uris.len() as u64;
            state.added.lock().push(uris);
            Ok(Json(json!({ "addedNeighbors": count })))
        }

        Some("removeNeighbors") => {
            let uris = uris();
            let mut neighbors = state.neighbors.lock();
            let before = neighbors.len();
            neighbors.retain(|(t, a)| !uris.contains(&format!("{}://{}", t, a)));
            let count = (before - neighbors.len()) as u64;
            drop(neighbors);
            state.removed.lock().push(uris);
            Ok(Json(json!({ "removedNeighbors": count })))
        }

        _ => Err(StatusCode::BAD_REQUEST),
    }
}
