//! In-process node wiring for tests and dry runs.
//!
//! [`TestNode`] builds a full [`NodeContext`] over the mock chain, the
//! in-memory peer backend, a temporary sled store and fixed telemetry, and
//! keeps typed handles to each so tests can steer and inspect them.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use dvpn_common::RetryPolicy;
use num_bigint::BigUint;

use crate::address;
use crate::chain::{ChainClient, ChainPolicies, ChainSession, ChainStatus, MockChainTransport};
use crate::context::{NodeConfig, NodeConfigBuilder, NodeContext, SharedState};
use crate::peer::{MemoryPeerService, PeerAdapter, ServiceType, WIREGUARD_KEY_LEN};
use crate::rpc_selector::StaticProber;
use crate::session::Session;
use crate::store::SessionStore;
use crate::telemetry::{FixedGeoIp, FixedSpeedTester};

pub struct TestNode {
    pub ctx: NodeContext,
    pub chain: Arc<MockChainTransport>,
    pub backend: Arc<MemoryPeerService>,
    pub geoip: Arc<FixedGeoIp>,
}

/// Retry budgets with short delays, for tests running on real time.
pub fn fast_policies() -> ChainPolicies {
    ChainPolicies {
        query: RetryPolicy::from_millis(5, 1),
        broadcast: RetryPolicy::from_millis(5, 1),
        confirm: RetryPolicy::from_millis(60, 1),
    }
}

/// Operator account used by [`TestNode`].
pub fn operator_account() -> String {
    address::encode("sent", &[0xAA; 20]).unwrap_or_default()
}

/// Client account `n`.
pub fn client_account(n: u8) -> String {
    address::encode("sent", &[n; 20]).unwrap_or_default()
}

/// A valid WireGuard public key, distinct per `n`.
pub fn wireguard_key(n: u8) -> String {
    general_purpose::STANDARD.encode([n; WIREGUARD_KEY_LEN])
}

impl TestNode {
    pub fn new(service_type: ServiceType) -> Self {
        Self::with_prober(service_type, StaticProber::new(), vec!["http://rpc-a".to_string()])
    }

    pub fn with_prober(service_type: ServiceType, prober: StaticProber, rpc_addrs: Vec<String>) -> Self {
        let config = NodeConfigBuilder::new()
            .moniker("test-node")
            .service_type(service_type)
            .account_address(operator_account())
            .rpc_addrs(rpc_addrs.clone())
            .chain_policies(fast_policies())
            .probe_timeout(Duration::from_secs(15))
            .build();
        let config: NodeConfig = match config {
            Ok(c) => c,
            Err(e) => panic!("test node config: {}", e),
        };
        let store = match SessionStore::temporary() {
            Ok(s) => s,
            Err(e) => panic!("test node store: {}", e),
        };

        let chain = Arc::new(MockChainTransport::new());
        let backend = Arc::new(MemoryPeerService::new(service_type));
        let geoip = Arc::new(FixedGeoIp::new(None));

        let ctx = NodeContext {
            state: SharedState::new(rpc_addrs.first().cloned().unwrap_or_default()),
            chain: Arc::new(ChainClient::new(chain.clone(), config.chain_policies)),
            config: Arc::new(config),
            store,
            peers: PeerAdapter::new(backend.clone()),
            prober: Arc::new(prober),
            geoip: geoip.clone(),
            speedtest: Arc::new(FixedSpeedTester::new(None)),
        };

        Self {
            ctx,
            chain,
            backend,
            geoip,
        }
    }

    /// Chain-side session bound to this node.
    pub fn chain_session(&self, id: u64, account: &str, status: ChainStatus) -> ChainSession {
        ChainSession {
            id,
            account_address: account.to_string(),
            node_address: self.ctx.config.node_address.clone(),
            download_bytes: "0".to_string(),
            upload_bytes: "0".to_string(),
            max_bytes: "1000000000".to_string(),
            duration: 0,
            max_duration: 3_600_000_000_000,
            status,
        }
    }

    /// Local session row bound to this node.
    pub fn local_session(&self, id: u64, peer_key: &str, created_at: DateTime<Utc>) -> Session {
        Session::new(
            id,
            client_account(id as u8),
            self.ctx.config.node_address.clone(),
            peer_key,
            self.ctx.config.service_type,
            created_at,
        )
        .with_max_bytes(&BigUint::from(1_000_000_000u64))
        .with_max_duration(Duration::from_secs(3600))
        .with_signature(b"client-signature")
    }
}
