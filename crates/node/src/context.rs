//! # Node Context
//!
//! Everything a job needs, shared by reference across all of them.
//!
//! ## Zones
//!
//! ```text
//! NodeContext
//!  ├─ config: Arc<NodeConfig>     static zone, built once, never mutated
//!  ├─ state:  SharedState         dynamic zone, one RwLock
//!  │            ├─ rpc_addr
//!  │            ├─ location
//!  │            └─ speedtest
//!  ├─ chain:  Arc<ChainClient>
//!  ├─ store:  SessionStore
//!  ├─ peers:  PeerAdapter
//!  └─ prober / geoip / speedtest collaborators
//! ```
//!
//! [`NodeConfigBuilder`] is the only mutable phase of the static zone.
//! `build()` consumes it and returns a plain [`NodeConfig`]; there is no
//! setter on the result, so a late write is a compile error rather than a
//! runtime check.
//!
//! [`SharedState`] hides its lock: callers use getters and setters and
//! never hold the guard across an await.

use std::sync::Arc;
use std::time::Duration;

use dvpn_common::config::{parse_coins, Coin, Config, ConfigError};
use dvpn_common::RetryPolicy;
use parking_lot::RwLock;

use crate::address;
use crate::chain::{ChainClient, ChainPolicies};
use crate::peer::{PeerAdapter, ServiceType};
use crate::rpc_selector::EndpointProber;
use crate::store::SessionStore;
use crate::telemetry::{GeoIpResolver, Location, SpeedTester, SpeedtestResult};

// ════════════════════════════════════════════════════════════════════════════
// STATIC ZONE
// ════════════════════════════════════════════════════════════════════════════

/// Per-job intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub best_rpc_endpoint: Duration,
    pub geoip_location: Duration,
    pub session_usage_sync_with_blockchain: Duration,
    pub session_usage_sync_with_database: Duration,
    pub session_usage_validate: Duration,
    pub session_validate: Duration,
    pub speedtest: Duration,
    pub status_update: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            best_rpc_endpoint: Duration::from_secs(15),
            geoip_location: Duration::from_secs(24 * 60 * 60),
            session_usage_sync_with_blockchain: Duration::from_secs(60 * 60),
            session_usage_sync_with_database: Duration::from_secs(5),
            session_usage_validate: Duration::from_secs(5),
            session_validate: Duration::from_secs(60),
            speedtest: Duration::from_secs(7 * 24 * 60 * 60),
            status_update: Duration::from_secs(30 * 60),
        }
    }
}

/// Transaction options passed to the signing transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TxOptions {
    pub chain_id: String,
    pub from_name: String,
    pub fee_granter_address: Option<String>,
    pub gas: u64,
    pub gas_adjustment: f64,
    pub gas_prices: String,
    pub simulate_and_execute: bool,
}

/// Immutable node configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub moniker: String,
    pub remote_url: String,
    pub listen_on: String,
    pub service_type: ServiceType,
    pub account_address: String,
    pub node_address: String,
    pub gigabyte_prices: Vec<Coin>,
    pub hourly_prices: Vec<Coin>,
    pub rpc_addrs: Vec<String>,
    pub intervals: Intervals,
    pub chain_policies: ChainPolicies,
    pub query_timeout: Duration,
    pub probe_timeout: Duration,
    pub tx: TxOptions,
    pub max_peers: usize,
    pub backend_url: String,
    pub geoip_url: String,
    pub speedtest_url: String,
}

/// Mutable construction phase of [`NodeConfig`].
#[derive(Debug, Clone)]
pub struct NodeConfigBuilder {
    moniker: String,
    remote_url: String,
    listen_on: String,
    service_type: Option<ServiceType>,
    account_address: String,
    node_prefix: String,
    gigabyte_prices: Vec<Coin>,
    hourly_prices: Vec<Coin>,
    rpc_addrs: Vec<String>,
    intervals: Intervals,
    chain_policies: ChainPolicies,
    query_timeout: Duration,
    probe_timeout: Duration,
    tx: TxOptions,
    max_peers: usize,
    backend_url: String,
    geoip_url: String,
    speedtest_url: String,
}

impl Default for NodeConfigBuilder {
    fn default() -> Self {
        Self {
            moniker: String::new(),
            remote_url: String::new(),
            listen_on: "0.0.0.0:7777".to_string(),
            service_type: None,
            account_address: String::new(),
            node_prefix: "sentnode".to_string(),
            gigabyte_prices: Vec::new(),
            hourly_prices: Vec::new(),
            rpc_addrs: Vec::new(),
            intervals: Intervals::default(),
            chain_policies: ChainPolicies::default(),
            query_timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(15),
            tx: TxOptions {
                chain_id: String::new(),
                from_name: String::new(),
                fee_granter_address: None,
                gas: 200_000,
                gas_adjustment: 1.15,
                gas_prices: String::new(),
                simulate_and_execute: true,
            },
            max_peers: 250,
            backend_url: String::new(),
            geoip_url: String::new(),
            speedtest_url: String::new(),
        }
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

impl NodeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a builder from a validated configuration file.
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let n = &cfg.node;
        let service_type = cfg
            .service
            .kind
            .parse::<ServiceType>()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            moniker: n.moniker.clone(),
            remote_url: n.remote_url.clone(),
            listen_on: n.listen_on.clone(),
            service_type: Some(service_type),
            account_address: cfg.tx.from_address.clone(),
            node_prefix: n.address_prefix.clone(),
            gigabyte_prices: parse_coins(&n.gigabyte_prices)?,
            hourly_prices: parse_coins(&n.hourly_prices)?,
            rpc_addrs: cfg
                .query
                .rpc_addrs
                .iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
            intervals: Intervals {
                best_rpc_endpoint: secs(n.interval_best_rpc_endpoint_secs),
                geoip_location: secs(n.interval_geoip_location_secs),
                session_usage_sync_with_blockchain: secs(n.interval_session_usage_sync_with_blockchain_secs),
                session_usage_sync_with_database: secs(n.interval_session_usage_sync_with_database_secs),
                session_usage_validate: secs(n.interval_session_usage_validate_secs),
                session_validate: secs(n.interval_session_validate_secs),
                speedtest: secs(n.interval_speedtest_secs),
                status_update: secs(n.interval_status_update_secs),
            },
            chain_policies: ChainPolicies {
                query: RetryPolicy::from_millis(cfg.query.max_retries, cfg.query.retry_delay_ms),
                broadcast: RetryPolicy::from_millis(cfg.tx.broadcast_max_retries, cfg.tx.broadcast_retry_delay_ms),
                confirm: RetryPolicy::from_millis(cfg.tx.confirm_max_retries, cfg.tx.confirm_retry_delay_ms),
            },
            query_timeout: Duration::from_millis(cfg.query.timeout_ms),
            probe_timeout: Duration::from_millis(cfg.query.probe_timeout_ms),
            tx: TxOptions {
                chain_id: cfg.tx.chain_id.clone(),
                from_name: cfg.tx.from_name.clone(),
                fee_granter_address: cfg.tx.fee_granter_address.clone(),
                gas: cfg.tx.gas,
                gas_adjustment: cfg.tx.gas_adjustment,
                gas_prices: cfg.tx.gas_prices.clone(),
                simulate_and_execute: cfg.tx.simulate_and_execute,
            },
            max_peers: cfg.service.max_peers,
            backend_url: cfg.service.backend_url.clone(),
            geoip_url: n.geoip_url.clone(),
            speedtest_url: n.speedtest_url.clone(),
        })
    }

    pub fn moniker(mut self, v: impl Into<String>) -> Self {
        self.moniker = v.into();
        self
    }

    pub fn service_type(mut self, v: ServiceType) -> Self {
        self.service_type = Some(v);
        self
    }

    pub fn account_address(mut self, v: impl Into<String>) -> Self {
        self.account_address = v.into();
        self
    }

    pub fn node_prefix(mut self, v: impl Into<String>) -> Self {
        self.node_prefix = v.into();
        self
    }

    pub fn rpc_addrs(mut self, v: Vec<String>) -> Self {
        self.rpc_addrs = v;
        self
    }

    pub fn intervals(mut self, v: Intervals) -> Self {
        self.intervals = v;
        self
    }

    pub fn chain_policies(mut self, v: ChainPolicies) -> Self {
        self.chain_policies = v;
        self
    }

    pub fn probe_timeout(mut self, v: Duration) -> Self {
        self.probe_timeout = v;
        self
    }

    /// Freezes the configuration.
    pub fn build(self) -> Result<NodeConfig, ConfigError> {
        let service_type = self
            .service_type
            .ok_or_else(|| ConfigError::Invalid("service type is not set".to_string()))?;
        if self.rpc_addrs.is_empty() {
            return Err(ConfigError::Invalid("no rpc address configured".to_string()));
        }
        let node_address = address::node_address_from_account(&self.account_address, &self.node_prefix)
            .map_err(|e| ConfigError::Invalid(format!("account address: {}", e)))?;

        Ok(NodeConfig {
            moniker: self.moniker,
            remote_url: self.remote_url,
            listen_on: self.listen_on,
            service_type,
            account_address: self.account_address,
            node_address,
            gigabyte_prices: self.gigabyte_prices,
            hourly_prices: self.hourly_prices,
            rpc_addrs: self.rpc_addrs,
            intervals: self.intervals,
            chain_policies: self.chain_policies,
            query_timeout: self.query_timeout,
            probe_timeout: self.probe_timeout,
            tx: self.tx,
            max_peers: self.max_peers,
            backend_url: self.backend_url,
            geoip_url: self.geoip_url,
            speedtest_url: self.speedtest_url,
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DYNAMIC ZONE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Dynamic {
    rpc_addr: String,
    location: Option<Location>,
    speedtest: Option<SpeedtestResult>,
}

/// Lock-guarded fields written by the telemetry and RPC jobs.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<Dynamic>>,
}

impl SharedState {
    pub fn new(rpc_addr: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Dynamic {
                rpc_addr: rpc_addr.into(),
                ..Dynamic::default()
            })),
        }
    }

    pub fn rpc_addr(&self) -> String {
        self.inner.read().rpc_addr.clone()
    }

    pub fn set_rpc_addr(&self, addr: impl Into<String>) {
        self.inner.write().rpc_addr = addr.into();
    }

    pub fn location(&self) -> Option<Location> {
        self.inner.read().location.clone()
    }

    pub fn set_location(&self, location: Location) {
        self.inner.write().location = Some(location);
    }

    pub fn speedtest(&self) -> Option<SpeedtestResult> {
        self.inner.read().speedtest
    }

    pub fn set_speedtest(&self, result: SpeedtestResult) {
        self.inner.write().speedtest = Some(result);
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CONTEXT
// ════════════════════════════════════════════════════════════════════════════

/// Shared handle passed to every job and HTTP handler. Cheap to clone.
#[derive(Clone)]
pub struct NodeContext {
    pub config: Arc<NodeConfig>,
    pub state: SharedState,
    pub chain: Arc<ChainClient>,
    pub store: SessionStore,
    pub peers: PeerAdapter,
    pub prober: Arc<dyn EndpointProber>,
    pub geoip: Arc<dyn GeoIpResolver>,
    pub speedtest: Arc<dyn SpeedTester>,
}

impl NodeContext {
    pub fn service_type(&self) -> ServiceType {
        self.config.service_type
    }

    pub fn node_address(&self) -> &str {
        &self.config.node_address
    }
}
