//! Admin HTTP surface
//!
//! - `GET  /`                                    node info
//! - `POST /accounts/:acc_address/sessions/:id`  admit a session, add its peer
//!
//! Plain HTTP; TLS termination is left to the deployment. CORS allows any
//! origin for GET and POST so browser clients can call both routes.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose, Engine as _};
use dvpn_common::Coin;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::admission::{create_session_and_add_peer, AdmissionError, AdmissionRequest};
use crate::context::NodeContext;
use crate::peer::PeerError;
use crate::telemetry::{Location, SpeedtestResult};

// ════════════════════════════════════════════════════════════════════════════
// APP STATE
// ════════════════════════════════════════════════════════════════════════════

pub struct ApiState {
    pub ctx: NodeContext,
    pub started: Instant,
}

// ════════════════════════════════════════════════════════════════════════════
// REQUEST / RESPONSE TYPES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResp {
    pub moniker: String,
    pub address: String,
    pub service_type: String,
    pub gigabyte_prices: Vec<Coin>,
    pub hourly_prices: Vec<Coin>,
    pub location: Option<Location>,
    pub speedtest: Option<SpeedtestResult>,
    pub rpc_addr: String,
    pub peers: usize,
    pub max_peers: usize,
    pub uptime_secs: u64,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct AddSessionReq {
    /// Peer key (WireGuard public key or V2Ray UUID).
    pub key: String,
    /// Base64 client signature.
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddSessionResp {
    /// Base64 backend payload for the client.
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResp {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResp>);

fn status_for(e: &AdmissionError) -> StatusCode {
    match e {
        AdmissionError::InvalidRequest(_) | AdmissionError::Peer(PeerError::InvalidKey { .. }) => {
            StatusCode::BAD_REQUEST
        }
        AdmissionError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        AdmissionError::SessionInactive { .. }
        | AdmissionError::AccountMismatch { .. }
        | AdmissionError::NodeMismatch { .. } => StatusCode::FORBIDDEN,
        AdmissionError::SessionExists(_)
        | AdmissionError::PeerKeyInUse
        | AdmissionError::Peer(PeerError::AlreadyExists(_)) => StatusCode::CONFLICT,
        AdmissionError::Peer(PeerError::Capacity(_)) => StatusCode::SERVICE_UNAVAILABLE,
        AdmissionError::Chain(_) => StatusCode::BAD_GATEWAY,
        AdmissionError::Peer(_) | AdmissionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ════════════════════════════════════════════════════════════════════════════

/// GET /
pub async fn info_handler(State(app): State<Arc<ApiState>>) -> Json<InfoResp> {
    let ctx = &app.ctx;
    let peers = match ctx.peers.peer_count().await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "peer count unavailable");
            0
        }
    };
    Json(InfoResp {
        moniker: ctx.config.moniker.clone(),
        address: ctx.config.node_address.clone(),
        service_type: ctx.config.service_type.to_string(),
        gigabyte_prices: ctx.config.gigabyte_prices.clone(),
        hourly_prices: ctx.config.hourly_prices.clone(),
        location: ctx.state.location(),
        speedtest: ctx.state.speedtest(),
        rpc_addr: ctx.state.rpc_addr(),
        peers,
        max_peers: ctx.config.max_peers,
        uptime_secs: app.started.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /accounts/:acc_address/sessions/:id
pub async fn add_session_handler(
    State(app): State<Arc<ApiState>>,
    Path((acc_address, id)): Path<(String, u64)>,
    Json(body): Json<AddSessionReq>,
) -> Result<(StatusCode, Json<AddSessionResp>), ApiError> {
    let req = AdmissionRequest {
        account_address: acc_address,
        session_id: id,
        peer_key: body.key,
        signature: body.signature,
    };
    match create_session_and_add_peer(&app.ctx, req).await {
        Ok(res) => Ok((
            StatusCode::CREATED,
            Json(AddSessionResp {
                data: general_purpose::STANDARD.encode(res.data),
            }),
        )),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!(session_id = id, error = %e, "session admission failed");
            }
            Err((status, Json(ErrorResp { error: e.to_string() })))
        }
    }
}

pub fn build_router(app_state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(info_handler))
        .route("/accounts/:acc_address/sessions/:id", post(add_session_handler))
        .layer(cors)
        .with_state(app_state)
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainStatus;
    use crate::peer::ServiceType;
    use crate::testing::{client_account, wireguard_key, TestNode};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router(node: &TestNode) -> Router {
        build_router(Arc::new(ApiState {
            ctx: node.ctx.clone(),
            started: Instant::now(),
        }))
    }

    async fn json_body<T: serde::de::DeserializeOwned>(resp: axum::response::Response) -> T {
        let bytes = to_bytes(resp.into_body(), 64 * 1024).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn add_request(account: &str, id: u64, key: &str) -> Request<Body> {
        let body = serde_json::json!({
            "key": key,
            "signature": general_purpose::STANDARD.encode(b"sig"),
        });
        Request::builder()
            .method("POST")
            .uri(format!("/accounts/{}/sessions/{}", account, id))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn info_reports_node_state() {
        let node = TestNode::new(ServiceType::WireGuard);
        let resp = router(&node)
            .oneshot(Request::builder().uri("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);

        let info: InfoResp = json_body(resp).await;
        assert_eq!(info.moniker, "test-node");
        assert_eq!(info.service_type, "wireguard");
        assert_eq!(info.rpc_addr, "http://rpc-a");
        assert_eq!(info.peers, 0);
    }

    #[tokio::test]
    async fn add_session_creates_peer() {
        let node = TestNode::new(ServiceType::WireGuard);
        let account = client_account(3);
        node.chain.put_session(node.chain_session(3, &account, ChainStatus::Active));
        let key = wireguard_key(3);

        let resp = router(&node).oneshot(add_request(&account, 3, &key)).await.expect("response");
        assert_eq!(resp.status(), StatusCode::CREATED);
        let _: AddSessionResp = json_body(resp).await;
        assert!(node.backend.contains(&key));
    }

    #[tokio::test]
    async fn cors_allows_any_origin() {
        let node = TestNode::new(ServiceType::WireGuard);
        let resp = router(&node)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(header::ORIGIN, "https://wallet.example")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let preflight = router(&node)
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/accounts/sent1abc/sessions/1")
                    .header(header::ORIGIN, "https://wallet.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(preflight.status(), StatusCode::OK);
        assert_eq!(preflight.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let methods = preflight.headers()[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .expect("ascii");
        assert!(methods.contains("POST"), "{}", methods);
    }

    #[tokio::test]
    async fn add_session_maps_errors() {
        let node = TestNode::new(ServiceType::WireGuard);
        let account = client_account(3);

        let resp = router(&node)
            .oneshot(add_request(&account, 3, &wireguard_key(3)))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let err: ErrorResp = json_body(resp).await;
        assert!(err.error.contains("does not exist"));

        let resp = router(&node).oneshot(add_request(&account, 3, "bad-key")).await.expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        node.chain.put_session(node.chain_session(3, &client_account(4), ChainStatus::Active));
        let resp = router(&node)
            .oneshot(add_request(&account, 3, &wireguard_key(3)))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
