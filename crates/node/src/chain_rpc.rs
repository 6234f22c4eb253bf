//! HTTP [`ChainTransport`] talking JSON to a signing chain gateway.
//!
//! The base URL is read from [`SharedState`] on every call, so a new best
//! endpoint published by the RPC selector takes effect on the next request.
//!
//! Routes:
//! - `GET  {rpc}/sessions/{id}` (404 → not found)
//! - `POST {rpc}/txs`           sign + broadcast (sync mode)
//! - `GET  {rpc}/txs/{hash}`    (404 → not yet included)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::chain::{
    ChainError, ChainMsg, ChainSession, ChainTransport, TxResponse, TxResult, CODE_OK, MEMPOOL_CACHE_ERROR,
};
use crate::context::{SharedState, TxOptions};

#[derive(Serialize)]
struct BroadcastRequest<'a> {
    chain_id: &'a str,
    from_name: &'a str,
    fee_granter: Option<&'a str>,
    gas: u64,
    gas_adjustment: f64,
    gas_prices: &'a str,
    simulate: bool,
    messages: &'a [ChainMsg],
}

#[derive(Deserialize)]
struct BroadcastResponse {
    #[serde(default)]
    tx_hash: String,
    #[serde(default)]
    code: u32,
    #[serde(default)]
    raw_log: String,
}

#[derive(Clone)]
pub struct HttpChainTransport {
    state: SharedState,
    tx: TxOptions,
    client: Client,
}

impl HttpChainTransport {
    pub fn new(state: SharedState, tx: TxOptions, timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        Ok(Self { state, tx, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.state.rpc_addr().trim_end_matches('/'), path)
    }
}

fn transport(e: reqwest::Error) -> ChainError {
    ChainError::Transport(e.to_string())
}

fn invalid(e: reqwest::Error) -> ChainError {
    ChainError::InvalidResponse(e.to_string())
}

#[async_trait]
impl ChainTransport for HttpChainTransport {
    async fn query_session(&self, id: u64) -> Result<Option<ChainSession>, ChainError> {
        let url = self.url(&format!("/sessions/{}", id));
        let resp = self.client.get(&url).send().await.map_err(transport)?;
        let status = resp.status();
        if status.is_success() {
            Ok(Some(resp.json::<ChainSession>().await.map_err(invalid)?))
        } else if status == StatusCode::NOT_FOUND {
            Ok(None)
        } else {
            let t = resp.text().await.unwrap_or_default();
            Err(ChainError::Transport(format!("query_session failed {} {}", status, t)))
        }
    }

    async fn broadcast_tx(&self, msgs: &[ChainMsg]) -> Result<TxResponse, ChainError> {
        let url = self.url("/txs");
        let body = BroadcastRequest {
            chain_id: &self.tx.chain_id,
            from_name: &self.tx.from_name,
            fee_granter: self.tx.fee_granter_address.as_deref(),
            gas: self.tx.gas,
            gas_adjustment: self.tx.gas_adjustment,
            gas_prices: &self.tx.gas_prices,
            simulate: self.tx.simulate_and_execute,
            messages: msgs,
        };
        let resp = self.client.post(&url).json(&body).send().await.map_err(transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport)?;

        let parsed = serde_json::from_str::<BroadcastResponse>(&text).ok();
        if !status.is_success() {
            let hash = parsed.as_ref().map(|r| r.tx_hash.as_str()).filter(|h| !h.is_empty());
            let log = parsed.as_ref().map(|r| r.raw_log.as_str()).unwrap_or(text.as_str());
            return Err(ChainError::from_broadcast_message(log, hash));
        }

        let r = parsed.ok_or_else(|| ChainError::InvalidResponse(format!("broadcast response: {}", text)))?;
        // CheckTx rejections come back as 200 with a non-zero code
        if r.code != CODE_OK && !r.tx_hash.is_empty() && r.raw_log.to_lowercase().contains(MEMPOOL_CACHE_ERROR) {
            return Err(ChainError::AlreadyInMempool { tx_hash: r.tx_hash });
        }
        Ok(TxResponse {
            tx_hash: r.tx_hash,
            code: r.code,
            log: r.raw_log,
        })
    }

    async fn query_tx(&self, tx_hash: &str) -> Result<TxResult, ChainError> {
        let url = self.url(&format!("/txs/{}", tx_hash));
        let resp = self.client.get(&url).send().await.map_err(transport)?;
        let status = resp.status();
        if status.is_success() {
            resp.json::<TxResult>().await.map_err(invalid)
        } else if status == StatusCode::NOT_FOUND {
            Err(ChainError::TxNotFound(tx_hash.to_string()))
        } else {
            let t = resp.text().await.unwrap_or_default();
            Err(ChainError::Transport(format!("query_tx failed {} {}", status, t)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainStatus, MsgUpdateNodeStatus};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport_for(addr: &str) -> HttpChainTransport {
        let tx = TxOptions {
            chain_id: "dvpn-1".into(),
            from_name: "operator".into(),
            fee_granter_address: None,
            gas: 1,
            gas_adjustment: 1.0,
            gas_prices: "0.1udvpn".into(),
            simulate_and_execute: false,
        };
        HttpChainTransport::new(SharedState::new(addr), tx, Duration::from_secs(1)).expect("client")
    }

    #[test]
    fn url_follows_shared_state() {
        let t = transport_for("http://a:26657/");
        assert_eq!(t.url("/txs"), "http://a:26657/txs");
        t.state.set_rpc_addr("http://b:26657");
        assert_eq!(t.url("/sessions/4"), "http://b:26657/sessions/4");
    }

    #[test]
    fn broadcast_body_shape() {
        let msgs = vec![ChainMsg::UpdateNodeStatus(MsgUpdateNodeStatus {
            node_address: "sentnode1x".into(),
            status: ChainStatus::Active,
        })];
        let body = BroadcastRequest {
            chain_id: "dvpn-1",
            from_name: "operator",
            fee_granter: None,
            gas: 5,
            gas_adjustment: 1.5,
            gas_prices: "1udvpn",
            simulate: true,
            messages: &msgs,
        };
        let v = serde_json::to_value(&body).expect("json");
        assert_eq!(v["messages"][0]["type"], "update_node_status");
        assert_eq!(v["messages"][0]["status"], "active");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let t = transport_for("http://127.0.0.1:9");
        assert!(matches!(t.query_session(1).await, Err(ChainError::Transport(_))));
    }

    // ── gateway responses ──

    #[tokio::test]
    async fn query_session_maps_found_and_missing() {
        let server = MockServer::start().await;
        let session = ChainSession {
            id: 7,
            account_address: "sent1abc".into(),
            node_address: "sentnode1abc".into(),
            download_bytes: "10".into(),
            upload_bytes: "20".into(),
            max_bytes: "340282366920938463463374607431768211456".into(),
            duration: 5,
            max_duration: 3_600_000_000_000,
            status: ChainStatus::Active,
        };
        Mock::given(method("GET"))
            .and(path("/sessions/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&session))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sessions/8"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let t = transport_for(&server.uri());
        assert_eq!(t.query_session(7).await.expect("query"), Some(session));
        assert_eq!(t.query_session(8).await.expect("query"), None);
    }

    #[tokio::test]
    async fn broadcast_classifies_mempool_duplicate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/txs"))
            .and(body_partial_json(serde_json::json!({ "chain_id": "dvpn-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tx_hash": "ABC",
                "code": 19,
                "raw_log": "tx already exists in cache",
            })))
            .mount(&server)
            .await;

        let t = transport_for(&server.uri());
        let err = t.broadcast_tx(&[]).await.unwrap_err();
        assert!(matches!(err, ChainError::AlreadyInMempool { ref tx_hash } if tx_hash == "ABC"));
    }

    #[tokio::test]
    async fn broadcast_passes_other_codes_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/txs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tx_hash": "DEF",
                "code": 5,
                "raw_log": "insufficient funds",
            })))
            .mount(&server)
            .await;

        let t = transport_for(&server.uri());
        let resp = t.broadcast_tx(&[]).await.expect("response");
        assert_eq!(resp.code, 5);
        assert!(!resp.is_ok());
    }

    #[tokio::test]
    async fn query_tx_not_found_until_included() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/txs/ABC"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let t = transport_for(&server.uri());
        assert!(matches!(t.query_tx("ABC").await, Err(ChainError::TxNotFound(_))));
    }
}
