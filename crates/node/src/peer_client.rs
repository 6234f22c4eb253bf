//! HTTP client for the VPN backend sidecar.
//!
//! - `POST   /peers`            add (`409` → already exists), returns `{ "data": base64 }`
//! - `GET    /peer?key=`        presence (`404` → absent)
//! - `DELETE /peer?key=`        remove (`404` → not found)
//! - `GET    /peers/stats`      per-peer byte counters
//! - `GET    /peers/count`      `{ "count": n }`

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::peer::{AddPeerResponse, PeerError, PeerRequest, PeerService, PeerStatistic, ServiceType};

/// [`PeerService`] backed by the VPN backend's management sidecar.
///
/// The sidecar owns the actual WireGuard / V2Ray process; this client only
/// speaks its small JSON API.
#[derive(Clone)]
pub struct HttpPeerService {
    base: String,
    service_type: ServiceType,
    client: Client,
}

#[derive(Deserialize)]
struct AddPeerBody {
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
struct CountBody {
    count: usize,
}

fn backend(e: reqwest::Error) -> PeerError {
    PeerError::Backend(e.to_string())
}

impl HttpPeerService {
    pub fn new(base: impl Into<String>, service_type: ServiceType, timeout: Duration) -> Result<Self, PeerError> {
        let client = Client::builder().timeout(timeout).build().map_err(backend)?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            service_type,
            client,
        })
    }

    async fn fail(what: &str, resp: reqwest::Response) -> PeerError {
        let status = resp.status();
        let t = resp.text().await.unwrap_or_default();
        PeerError::Backend(format!("{} failed {} {}", what, status, t))
    }
}

#[async_trait]
impl PeerService for HttpPeerService {
    fn service_type(&self) -> ServiceType {
        self.service_type
    }

    async fn add_peer(&self, req: &PeerRequest) -> Result<AddPeerResponse, PeerError> {
        let url = format!("{}/peers", self.base);
        let resp = self.client.post(&url).json(req).send().await.map_err(backend)?;
        match resp.status() {
            s if s.is_success() => {
                let body = resp.json::<AddPeerBody>().await.map_err(backend)?;
                let data = general_purpose::STANDARD
                    .decode(body.data)
                    .map_err(|e| PeerError::Backend(format!("add_peer response: {}", e)))?;
                Ok(AddPeerResponse { data })
            }
            StatusCode::CONFLICT => Err(PeerError::AlreadyExists(req.key().to_string())),
            _ => Err(Self::fail("add_peer", resp).await),
        }
    }

    async fn has_peer(&self, req: &PeerRequest) -> Result<bool, PeerError> {
        let url = format!("{}/peer", self.base);
        let resp = self
            .client
            .get(&url)
            .query(&[("key", req.key())])
            .send()
            .await
            .map_err(backend)?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::fail("has_peer", resp).await),
        }
    }

    async fn remove_peer(&self, req: &PeerRequest) -> Result<(), PeerError> {
        let url = format!("{}/peer", self.base);
        let resp = self
            .client
            .delete(&url)
            .query(&[("key", req.key())])
            .send()
            .await
            .map_err(backend)?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(PeerError::NotFound(req.key().to_string())),
            _ => Err(Self::fail("remove_peer", resp).await),
        }
    }

    async fn peer_statistics(&self) -> Result<Vec<PeerStatistic>, PeerError> {
        let url = format!("{}/peers/stats", self.base);
        let resp = self.client.get(&url).send().await.map_err(backend)?;
        if !resp.status().is_success() {
            return Err(Self::fail("peer_statistics", resp).await);
        }
        resp.json::<Vec<PeerStatistic>>().await.map_err(backend)
    }

    async fn peer_count(&self) -> Result<usize, PeerError> {
        let url = format!("{}/peers/count", self.base);
        let resp = self.client.get(&url).send().await.map_err(backend)?;
        if !resp.status().is_success() {
            return Err(Self::fail("peer_count", resp).await);
        }
        Ok(resp.json::<CountBody>().await.map_err(backend)?.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerAdapter;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "67e55044-10b1-426f-9247-bb680e5fe0c8";

    fn service(base: &str) -> HttpPeerService {
        HttpPeerService::new(base, ServiceType::V2Ray, Duration::from_secs(1)).expect("client")
    }

    #[tokio::test]
    async fn add_peer_decodes_payload_and_maps_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/peers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": general_purpose::STANDARD.encode(b"vmess-config"),
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/peers"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let adapter = PeerAdapter::new(Arc::new(service(&server.uri())));
        let (_, res) = adapter.add_peer_for_key(KEY).await.expect("add");
        assert_eq!(res.data, b"vmess-config");

        let err = adapter.add_peer_for_key(KEY).await.unwrap_err();
        assert!(matches!(err, PeerError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn presence_and_removal_follow_status_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/peer"))
            .and(query_param("key", KEY))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/peer"))
            .and(query_param("key", KEY))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = PeerAdapter::new(Arc::new(service(&server.uri())));
        assert!(!adapter.has_peer_for_key(KEY).await.expect("has"));
        assert!(matches!(
            adapter.remove_peer_for_key(KEY).await,
            Err(PeerError::NotFound(_))
        ));
        // absent peer: nothing to remove, no DELETE issued
        adapter.remove_peer_if_exists_for_key(KEY).await.expect("idempotent");
    }

    #[tokio::test]
    async fn statistics_and_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/peers/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "key": KEY, "download_bytes": 1024, "upload_bytes": 2048 },
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/peers/count"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "count": 3 })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/peer"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let svc = service(&server.uri());
        let stats = svc.peer_statistics().await.expect("stats");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].download_bytes, 1024);
        assert_eq!(svc.peer_count().await.expect("count"), 3);

        let req = ServiceType::V2Ray.request_for_key(KEY).expect("request");
        assert!(matches!(svc.has_peer(&req).await, Err(PeerError::Backend(_))));
    }
}
