//! # nelson-api
//!
//! Read-only status API for the Nelson daemon.
//!
//! Endpoints:
//! - `GET /` - readiness, ledger health, peer counts, config echo, heart
//! - `GET /peers` - all known peers
//! - `GET /peer-stats` - first-seen / last-active trailing-window counts
//!
//! CORS is wide open; the API carries no mutating surface.

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;

use axum::Router;

/// Default API port.
pub const DEFAULT_API_PORT: u16 = 18600;

/// Create the API router with all routes.
pub fn build_api(state: AppState) -> Router {
    create_router(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use nelson_heart::{Heart, HeartConfig};
    use nelson_iri::{IriClient, IriConfig};
    use nelson_peers::{PeerList, PeerListConfig};
    use nelson_store::Database;
    use parking_lot::RwLock;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_api() -> (Router, AppState) {
        let store = Arc::new(Database::open_temporary().unwrap());
        let peers = Arc::new(PeerList::new(store, PeerListConfig::default()));
        let (iri, _iri_events) = IriClient::new(IriConfig::default());
        let (heart, _events, _commands) = Heart::new(HeartConfig::default());

        let state = AppState::new(
            peers,
            Arc::new(iri),
            heart.monitor(),
            Arc::new(RwLock::new(Vec::new())),
            serde_json::json!({"port": 16600}),
        );
        (build_api(state.clone()), state)
    }

    async fn get_json(router: &Router, path: &str) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_status_shape() {
        let (router, state) = create_test_api();

        let (status, body) = get_json(&router, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], Value::Bool(false));
        assert_eq!(body["iriHealthy"], Value::Bool(false));
        assert_eq!(body["totalPeers"], Value::from(0));
        assert_eq!(body["config"]["port"], Value::from(16600));
        assert!(body["heart"]["personality"].is_string());

        state.set_ready(true);
        let (_, body) = get_json(&router, "/").await;
        assert_eq!(body["ready"], Value::Bool(true));
    }

    #[tokio::test]
    async fn test_peers_and_stats() {
        let (router, state) = create_test_api();
        state
            .peers
            .add("8.8.8.8", 16600, 15600, 14600, true, 1.0)
            .await
            .unwrap();

        let (status, body) = get_json(&router, "/peers").await;
        assert_eq!(status, StatusCode::OK);
        let peers = body.as_array().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0]["hostname"], Value::from("8.8.8.8"));
        assert_eq!(peers[0]["isTrusted"], Value::Bool(true));

        let (status, body) = get_json(&router, "/peer-stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["newPeers"]["hourAgo"], Value::from(1));
        assert_eq!(body["activePeers"]["hourAgo"], Value::from(0));
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let (router, _state) = create_test_api();

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/")
                    .header("origin", "http://example.com")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .contains_key("access-control-allow-origin"));
    }
}
