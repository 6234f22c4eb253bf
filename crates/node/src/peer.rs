//! # Peer Service Adapter
//!
//! Unifies heterogeneous VPN backends behind one key-addressed API.
//!
//! ## Dispatch
//!
//! ```text
//! peer key (string) ──▶ ServiceType::request_for_key ──▶ PeerRequest ──▶ dyn PeerService
//!                          │
//!                          ├─ V2Ray     → key must be a UUID
//!                          └─ WireGuard → key must be a base64 32-byte public key
//! ```
//!
//! [`ServiceType`] is a closed enum: adding a backend kind means adding a
//! variant, and every `match` over it must then handle the new kind. An
//! unknown backend name is rejected once, when configuration is parsed.
//!
//! ## Idempotent removal
//!
//! [`PeerAdapter::remove_peer_if_exists_for_key`] checks existence first and
//! only removes a peer that is still present, so quota enforcement and
//! reconciliation may both target the same peer without a backend error on
//! the second call.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// WireGuard public keys are Curve25519 points.
pub const WIREGUARD_KEY_LEN: usize = 32;

// ════════════════════════════════════════════════════════════════════════════
// SERVICE TYPE
// ════════════════════════════════════════════════════════════════════════════

/// Kind of VPN backend this node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    V2Ray,
    WireGuard,
}

impl ServiceType {
    /// Builds the backend-specific request for a generic peer key.
    pub fn request_for_key(self, key: &str) -> Result<PeerRequest, PeerError> {
        match self {
            ServiceType::V2Ray => {
                let uuid = Uuid::parse_str(key.trim()).map_err(|e| PeerError::InvalidKey {
                    service: self,
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(PeerRequest::V2Ray {
                    uuid: uuid.hyphenated().to_string(),
                })
            }
            ServiceType::WireGuard => {
                let raw = general_purpose::STANDARD
                    .decode(key.trim())
                    .map_err(|e| PeerError::InvalidKey {
                        service: self,
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                if raw.len() != WIREGUARD_KEY_LEN {
                    return Err(PeerError::InvalidKey {
                        service: self,
                        key: key.to_string(),
                        reason: format!("expected {} bytes, got {}", WIREGUARD_KEY_LEN, raw.len()),
                    });
                }
                Ok(PeerRequest::WireGuard {
                    public_key: general_purpose::STANDARD.encode(raw),
                })
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::V2Ray => "v2ray",
            ServiceType::WireGuard => "wireguard",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v2ray" => Ok(ServiceType::V2Ray),
            "wireguard" => Ok(ServiceType::WireGuard),
            other => Err(PeerError::UnknownServiceType(other.to_string())),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// REQUESTS / RESPONSES
// ════════════════════════════════════════════════════════════════════════════

/// Backend-specific peer identity, built from a generic peer key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PeerRequest {
    V2Ray { uuid: String },
    WireGuard { public_key: String },
}

impl PeerRequest {
    pub fn service_type(&self) -> ServiceType {
        match self {
            PeerRequest::V2Ray { .. } => ServiceType::V2Ray,
            PeerRequest::WireGuard { .. } => ServiceType::WireGuard,
        }
    }

    /// Canonical peer key, as stored in `Session::peer_key`.
    pub fn key(&self) -> &str {
        match self {
            PeerRequest::V2Ray { uuid } => uuid,
            PeerRequest::WireGuard { public_key } => public_key,
        }
    }
}

/// Backend answer to an add-peer request (client connection parameters).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPeerResponse {
    /// Opaque backend payload handed back to the client.
    pub data: Vec<u8>,
}

/// Cumulative traffic counters of one connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatistic {
    pub key: String,
    pub download_bytes: u64,
    pub upload_bytes: u64,
}

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("invalid service type: {0}")]
    UnknownServiceType(String),

    #[error("invalid {service} peer key '{key}': {reason}")]
    InvalidKey {
        service: ServiceType,
        key: String,
        reason: String,
    },

    #[error("peer already exists: {0}")]
    AlreadyExists(String),

    #[error("peer not found: {0}")]
    NotFound(String),

    #[error("peer limit reached ({0})")]
    Capacity(usize),

    #[error("backend error: {0}")]
    Backend(String),
}

// ════════════════════════════════════════════════════════════════════════════
// SERVICE TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Contract every VPN backend implements.
///
/// Implementations only ever receive requests of their own
/// [`service_type`](Self::service_type); the adapter builds them.
#[async_trait]
pub trait PeerService: Send + Sync {
    fn service_type(&self) -> ServiceType;

    async fn add_peer(&self, req: &PeerRequest) -> Result<AddPeerResponse, PeerError>;

    async fn has_peer(&self, req: &PeerRequest) -> Result<bool, PeerError>;

    async fn remove_peer(&self, req: &PeerRequest) -> Result<(), PeerError>;

    async fn peer_statistics(&self) -> Result<Vec<PeerStatistic>, PeerError>;

    async fn peer_count(&self) -> Result<usize, PeerError>;
}

// ════════════════════════════════════════════════════════════════════════════
// ADAPTER
// ════════════════════════════════════════════════════════════════════════════

/// Key-addressed facade over the configured [`PeerService`].
#[derive(Clone)]
pub struct PeerAdapter {
    service: Arc<dyn PeerService>,
}

impl PeerAdapter {
    pub fn new(service: Arc<dyn PeerService>) -> Self {
        Self { service }
    }

    pub fn service_type(&self) -> ServiceType {
        self.service.service_type()
    }

    pub fn request_for_key(&self, key: &str) -> Result<PeerRequest, PeerError> {
        self.service_type().request_for_key(key)
    }

    pub async fn add_peer_for_key(&self, key: &str) -> Result<(PeerRequest, AddPeerResponse), PeerError> {
        let req = self.request_for_key(key)?;
        let res = self.service.add_peer(&req).await?;
        Ok((req, res))
    }

    pub async fn has_peer_for_key(&self, key: &str) -> Result<bool, PeerError> {
        let req = self.request_for_key(key)?;
        self.service.has_peer(&req).await
    }

    pub async fn remove_peer_for_key(&self, key: &str) -> Result<(), PeerError> {
        let req = self.request_for_key(key)?;
        self.service.remove_peer(&req).await
    }

    /// Removes the peer only if the backend still has it.
    pub async fn remove_peer_if_exists_for_key(&self, key: &str) -> Result<(), PeerError> {
        let req = self.request_for_key(key)?;
        if !self.service.has_peer(&req).await? {
            debug!(peer_key = %key, "peer already absent");
            return Ok(());
        }
        self.service.remove_peer(&req).await
    }

    pub async fn peer_statistics(&self) -> Result<Vec<PeerStatistic>, PeerError> {
        self.service.peer_statistics().await
    }

    pub async fn peer_count(&self) -> Result<usize, PeerError> {
        self.service.peer_count().await
    }
}

// ════════════════════════════════════════════════════════════════════════════
// IN-MEMORY BACKEND
// ════════════════════════════════════════════════════════════════════════════

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryPeerService;

#[cfg(any(test, feature = "test-util"))]
mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    #[derive(Debug, Clone, Default)]
    struct PeerEntry {
        download_bytes: u64,
        upload_bytes: u64,
    }

    /// Backend that keeps peers in a map. Used by tests and local dry runs.
    ///
    /// Mirrors the strictness of real backends: adding an existing peer or
    /// removing a missing one is an error.
    pub struct MemoryPeerService {
        service_type: ServiceType,
        max_peers: usize,
        peers: Mutex<HashMap<String, PeerEntry>>,
        removals: AtomicUsize,
    }

    impl MemoryPeerService {
        pub fn new(service_type: ServiceType) -> Self {
            Self::with_capacity(service_type, usize::MAX)
        }

        pub fn with_capacity(service_type: ServiceType, max_peers: usize) -> Self {
            Self {
                service_type,
                max_peers,
                peers: Mutex::new(HashMap::new()),
                removals: AtomicUsize::new(0),
            }
        }

        /// Overwrites the traffic counters of a connected peer.
        pub fn set_usage(&self, key: &str, download_bytes: u64, upload_bytes: u64) {
            if let Some(entry) = self.peers.lock().get_mut(key) {
                entry.download_bytes = download_bytes;
                entry.upload_bytes = upload_bytes;
            }
        }

        pub fn contains(&self, key: &str) -> bool {
            self.peers.lock().contains_key(key)
        }

        /// Number of successful `remove_peer` calls so far.
        pub fn removal_count(&self) -> usize {
            self.removals.load(Ordering::SeqCst)
        }

        fn check_type(&self, req: &PeerRequest) -> Result<(), PeerError> {
            if req.service_type() != self.service_type {
                return Err(PeerError::Backend(format!(
                    "{} backend received {} request",
                    self.service_type,
                    req.service_type()
                )));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PeerService for MemoryPeerService {
        fn service_type(&self) -> ServiceType {
            self.service_type
        }

        async fn add_peer(&self, req: &PeerRequest) -> Result<AddPeerResponse, PeerError> {
            self.check_type(req)?;
            let mut peers = self.peers.lock();
            if peers.contains_key(req.key()) {
                return Err(PeerError::AlreadyExists(req.key().to_string()));
            }
            if peers.len() >= self.max_peers {
                return Err(PeerError::Capacity(self.max_peers));
            }
            peers.insert(req.key().to_string(), PeerEntry::default());
            Ok(AddPeerResponse {
                data: req.key().as_bytes().to_vec(),
            })
        }

        async fn has_peer(&self, req: &PeerRequest) -> Result<bool, PeerError> {
            self.check_type(req)?;
            Ok(self.peers.lock().contains_key(req.key()))
        }

        async fn remove_peer(&self, req: &PeerRequest) -> Result<(), PeerError> {
            self.check_type(req)?;
            match self.peers.lock().remove(req.key()) {
                Some(_) => {
                    self.removals.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                None => Err(PeerError::NotFound(req.key().to_string())),
            }
        }

        async fn peer_statistics(&self) -> Result<Vec<PeerStatistic>, PeerError> {
            let peers = self.peers.lock();
            let mut out: Vec<PeerStatistic> = peers
                .iter()
                .map(|(key, e)| PeerStatistic {
                    key: key.clone(),
                    download_bytes: e.download_bytes,
                    upload_bytes: e.upload_bytes,
                })
                .collect();
            out.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(out)
        }

        async fn peer_count(&self) -> Result<usize, PeerError> {
            Ok(self.peers.lock().len())
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn wg_key(byte: u8) -> String {
        general_purpose::STANDARD.encode([byte; WIREGUARD_KEY_LEN])
    }

    fn adapter(kind: ServiceType) -> (Arc<MemoryPeerService>, PeerAdapter) {
        let svc = Arc::new(MemoryPeerService::new(kind));
        (svc.clone(), PeerAdapter::new(svc))
    }

    #[test]
    fn service_type_parsing() {
        assert_eq!("wireguard".parse::<ServiceType>(), Ok(ServiceType::WireGuard));
        assert_eq!("V2Ray".parse::<ServiceType>(), Ok(ServiceType::V2Ray));
        assert!(matches!(
            "openvpn".parse::<ServiceType>(),
            Err(PeerError::UnknownServiceType(_))
        ));
    }

    #[test]
    fn wireguard_request_requires_32_byte_key() {
        let ok = ServiceType::WireGuard.request_for_key(&wg_key(1));
        assert!(matches!(ok, Ok(PeerRequest::WireGuard { .. })));

        let short = general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(
            ServiceType::WireGuard.request_for_key(&short),
            Err(PeerError::InvalidKey { .. })
        ));
        assert!(ServiceType::WireGuard.request_for_key("%%%").is_err());
    }

    #[test]
    fn v2ray_request_requires_uuid() {
        let req = ServiceType::V2Ray
            .request_for_key("67E55044-10B1-426F-9247-BB680E5FE0C8")
            .expect("uuid");
        assert_eq!(req.key(), "67e55044-10b1-426f-9247-bb680e5fe0c8");
        assert!(ServiceType::V2Ray.request_for_key("not-a-uuid").is_err());
    }

    #[tokio::test]
    async fn remove_if_exists_is_idempotent() {
        let (svc, peers) = adapter(ServiceType::WireGuard);
        let key = wg_key(7);
        peers.add_peer_for_key(&key).await.expect("add");
        assert!(peers.has_peer_for_key(&key).await.expect("has"));

        peers.remove_peer_if_exists_for_key(&key).await.expect("first remove");
        assert!(!peers.has_peer_for_key(&key).await.expect("has"));

        peers.remove_peer_if_exists_for_key(&key).await.expect("second remove");
        assert!(!peers.has_peer_for_key(&key).await.expect("has"));
        assert_eq!(svc.removal_count(), 1);
    }

    #[tokio::test]
    async fn plain_remove_of_missing_peer_errors() {
        let (_svc, peers) = adapter(ServiceType::WireGuard);
        let err = peers.remove_peer_for_key(&wg_key(9)).await.unwrap_err();
        assert!(matches!(err, PeerError::NotFound(_)));
    }

    #[tokio::test]
    async fn statistics_and_count() {
        let (svc, peers) = adapter(ServiceType::WireGuard);
        let a = wg_key(1);
        let b = wg_key(2);
        peers.add_peer_for_key(&a).await.expect("add a");
        peers.add_peer_for_key(&b).await.expect("add b");
        svc.set_usage(&a, 100, 50);

        assert_eq!(peers.peer_count().await.expect("count"), 2);
        let stats = peers.peer_statistics().await.expect("stats");
        let sa = stats.iter().find(|s| s.key == a).expect("a stats");
        assert_eq!((sa.download_bytes, sa.upload_bytes), (100, 50));
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let svc = Arc::new(MemoryPeerService::with_capacity(ServiceType::WireGuard, 1));
        let peers = PeerAdapter::new(svc);
        peers.add_peer_for_key(&wg_key(1)).await.expect("first");
        assert!(matches!(
            peers.add_peer_for_key(&wg_key(2)).await,
            Err(PeerError::Capacity(1))
        ));
    }
}
