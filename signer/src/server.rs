//! Axum HTTP server for a signer node
//!
//! Status endpoints plus the `/bus` inbox used by the HTTP group bus.

use crate::node::SignerNode;
use crate::keystore::StoredKey;
use crate::types::{ErrorResponse, HealthResponse, KeyInfo, SignerInfo};
use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::{routing::get, Json, Router};
use safe_common::bus::bus_router;
use safe_common::BusFrame;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
pub struct AppState {
    pub node: Arc<SignerNode>,
}

/// Create the router with all endpoints; frames posted to `/bus` go to
/// `inbound`
pub fn create_router(state: Arc<AppState>, inbound: mpsc::UnboundedSender<BusFrame>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/keys", get(keys_handler))
        .route("/keys/{fingerprint}", get(key_handler))
        .with_state(state)
        .merge(bus_router(inbound))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let key_count = state.node.key_count().await;
    Json(HealthResponse {
        status: if key_count > 0 { "ready" } else { "no_keys" }.to_string(),
        node_id: state.node.context().node_id.clone(),
        key_count,
    })
}

async fn info_handler(State(state): State<Arc<AppState>>) -> Json<SignerInfo> {
    let ctx = state.node.context();
    Json(SignerInfo {
        node_id: ctx.node_id.clone(),
        members: ctx.members.clone(),
        threshold: ctx.threshold,
        key_count: state.node.key_count().await,
        transport_public_key: ctx.transport_public_hex(),
        active_sessions: state.node.active_sessions().await,
    })
}

fn key_info(key: StoredKey) -> KeyInfo {
    KeyInfo {
        session_id: key.session_id,
        curve: key.curve,
        public_key: hex::encode(&key.public),
        fingerprint: hex::encode(key.fingerprint()),
        chain_code: hex::encode(key.chain_code),
    }
}

/// Public half of every key this node holds a share of
async fn keys_handler(State(state): State<Arc<AppState>>) -> Json<Vec<KeyInfo>> {
    Json(state.node.keys().await.into_iter().map(key_info).collect())
}

async fn key_handler(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<KeyInfo>, (StatusCode, Json<ErrorResponse>)> {
    let wanted = fingerprint.to_lowercase();
    state
        .node
        .keys()
        .await
        .into_iter()
        .find(|key| hex::encode(key.fingerprint()) == wanted)
        .map(|key| Json(key_info(key)))
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("KEY_NOT_FOUND", "no key with this fingerprint").with_details(fingerprint)),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{KeyShare, Keystore, StoredKey};
    use crate::session::testing::group;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use safe_common::{Curve, MemoryBus, OperationCipher};
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn create_test_app(dir: &tempfile::TempDir) -> (Router, mpsc::UnboundedReceiver<BusFrame>) {
        let keystore = Keystore::new(dir.path(), "a", "test");
        keystore
            .save(&StoredKey {
                session_id: Uuid::new_v4(),
                curve: Curve::Secp256k1EcdsaEthereum,
                public: vec![3u8; 33],
                chain_code: [4u8; 32],
                share: KeyShare::Ecdsa {
                    private_share: vec![5u8; 32],
                    public_key: vec![3u8; 33],
                },
            })
            .unwrap();

        let (ctx, _rx) = group(MemoryBus::new(), &["a", "b", "c"], 2, Duration::from_secs(1))
            .into_iter()
            .next()
            .unwrap();
        let node = SignerNode::new(
            ctx,
            "keeper",
            Uuid::new_v4(),
            OperationCipher::new(b"secret"),
            keystore,
            Duration::from_secs(10),
        )
        .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(AppState { node: Arc::new(node) });
        (create_router(state, tx), rx)
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = create_test_app(&dir);
        let json = get_json(app, "/health").await;
        assert_eq!(json["status"], "ready");
        assert_eq!(json["key_count"], 1);
    }

    #[tokio::test]
    async fn test_info_lists_members() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = create_test_app(&dir);
        let json = get_json(app, "/info").await;
        assert_eq!(json["node_id"], "a");
        assert_eq!(json["members"], serde_json::json!(["a", "b", "c"]));
        assert_eq!(json["threshold"], 2);
    }

    #[tokio::test]
    async fn test_keys_are_hex() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = create_test_app(&dir);
        let json = get_json(app, "/keys").await;
        assert_eq!(json[0]["public_key"], hex::encode([3u8; 33]));
        assert_eq!(json[0]["fingerprint"].as_str().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_unknown_fingerprint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = create_test_app(&dir);
        let response = app
            .oneshot(Request::builder().uri("/keys/0011223344556677").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "KEY_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_bus_frames_reach_inbound() {
        let dir = tempfile::tempdir().unwrap();
        let (app, mut rx) = create_test_app(&dir);
        let frame = BusFrame::Session(safe_common::SessionMessage {
            session_id: Uuid::new_v4(),
            round: 1,
            seq: 0,
            from: "b".to_string(),
            to: None,
            payload: vec![],
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/bus")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&frame).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(rx.try_recv().unwrap(), frame);
    }
}
