//! Node configuration file model, loaded from TOML with serde.
//!
//! Every field has a default so a partial file is valid input; required
//! operator values (moniker, chain id, account) are enforced by
//! [`Config::validate`] rather than by deserialization.
//!
//! Intervals are whole seconds (`*_secs`), timeouts and backoffs are
//! milliseconds (`*_ms`).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

/// Errors raised while loading, parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ════════════════════════════════════════════════════════════════════════════
// SECTIONS
// ════════════════════════════════════════════════════════════════════════════

/// Root of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeSection,
    pub query: QuerySection,
    pub tx: TxSection,
    pub service: ServiceSection,
    pub log: LogSection,
}

/// `[node]`: identity, pricing and job intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Human-readable node name announced on chain.
    pub moniker: String,
    /// Admin HTTP listen address, e.g. `0.0.0.0:7777`.
    pub listen_on: String,
    /// Public URL clients use to reach this node.
    pub remote_url: String,
    /// Bech32 prefix of node addresses.
    pub address_prefix: String,
    /// Price per gigabyte, e.g. `"100udvpn,5uatom"`.
    pub gigabyte_prices: String,
    /// Price per hour, same format as `gigabyte_prices`.
    pub hourly_prices: String,
    /// GeoIP lookup URL returning the caller's location as JSON.
    pub geoip_url: String,
    /// URL downloaded (and uploaded to) by the speed test.
    pub speedtest_url: String,

    pub interval_best_rpc_endpoint_secs: u64,
    pub interval_geoip_location_secs: u64,
    pub interval_session_usage_sync_with_blockchain_secs: u64,
    pub interval_session_usage_sync_with_database_secs: u64,
    pub interval_session_usage_validate_secs: u64,
    pub interval_session_validate_secs: u64,
    pub interval_speedtest_secs: u64,
    pub interval_status_update_secs: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            moniker: String::new(),
            listen_on: "0.0.0.0:7777".to_string(),
            remote_url: String::new(),
            address_prefix: "sentnode".to_string(),
            gigabyte_prices: String::new(),
            hourly_prices: String::new(),
            geoip_url: "http://ip-api.com/json".to_string(),
            speedtest_url: String::new(),
            interval_best_rpc_endpoint_secs: 15,
            interval_geoip_location_secs: 24 * 60 * 60,
            interval_session_usage_sync_with_blockchain_secs: 60 * 60,
            interval_session_usage_sync_with_database_secs: 5,
            interval_session_usage_validate_secs: 5,
            interval_session_validate_secs: 60,
            interval_speedtest_secs: 7 * 24 * 60 * 60,
            interval_status_update_secs: 30 * 60,
        }
    }
}

/// `[query]`: read-side chain access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySection {
    /// Candidate RPC endpoints probed by the best-endpoint job.
    pub rpc_addrs: Vec<String>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Per-request client timeout.
    pub timeout_ms: u64,
    /// Timeout of a single endpoint liveness probe.
    pub probe_timeout_ms: u64,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            rpc_addrs: vec!["http://127.0.0.1:26657".to_string()],
            max_retries: 5,
            retry_delay_ms: 1000,
            timeout_ms: 15_000,
            probe_timeout_ms: 15_000,
        }
    }
}

/// `[tx]`: write-side chain access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxSection {
    pub chain_id: String,
    /// Key name in the operator's keyring.
    pub from_name: String,
    /// Bech32 account address matching `from_name`.
    pub from_address: String,
    pub fee_granter_address: Option<String>,
    pub gas: u64,
    pub gas_adjustment: f64,
    pub gas_prices: String,
    pub simulate_and_execute: bool,

    pub broadcast_max_retries: u32,
    pub broadcast_retry_delay_ms: u64,
    pub confirm_max_retries: u32,
    pub confirm_retry_delay_ms: u64,
}

impl Default for TxSection {
    fn default() -> Self {
        Self {
            chain_id: String::new(),
            from_name: String::new(),
            from_address: String::new(),
            fee_granter_address: None,
            gas: 200_000,
            gas_adjustment: 1.15,
            gas_prices: "0.1udvpn".to_string(),
            simulate_and_execute: true,
            broadcast_max_retries: 5,
            broadcast_retry_delay_ms: 6000,
            confirm_max_retries: 60,
            confirm_retry_delay_ms: 1000,
        }
    }
}

/// `[service]`: VPN backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Backend kind: `wireguard` or `v2ray`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Management endpoint of the backend sidecar.
    pub backend_url: String,
    /// Maximum number of concurrently connected peers.
    pub max_peers: usize,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            kind: "wireguard".to_string(),
            backend_url: "http://127.0.0.1:7878".to_string(),
            max_peers: 250,
        }
    }
}

/// `[log]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PRICES
// ════════════════════════════════════════════════════════════════════════════

/// A single `<amount><denom>` price entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: u128,
}

/// Parses a comma-separated coin list such as `"100udvpn,5uatom"`.
///
/// An empty string yields an empty list.
pub fn parse_coins(s: &str) -> Result<Vec<Coin>, ConfigError> {
    let mut out = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let split = part
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid(format!("coin '{}' has no denom", part)))?;
        let (amount, denom) = part.split_at(split);
        if amount.is_empty() {
            return Err(invalid(format!("coin '{}' has no amount", part)));
        }
        if !denom.chars().all(|c| c.is_ascii_alphanumeric() || c == '/') {
            return Err(invalid(format!("coin '{}' has an invalid denom", part)));
        }
        let amount = amount
            .parse::<u128>()
            .map_err(|e| invalid(format!("coin '{}': {}", part, e)))?;
        out.push(Coin {
            denom: denom.to_string(),
            amount,
        });
    }
    Ok(out)
}

// ════════════════════════════════════════════════════════════════════════════
// LOAD / SAVE / VALIDATE
// ════════════════════════════════════════════════════════════════════════════

impl Config {
    /// Parses a config from TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Serializes the config as TOML text.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks operator-supplied values that have no usable default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = &self.node;
        if n.moniker.trim().is_empty() {
            return Err(invalid("node.moniker must be non-empty"));
        }
        if n.listen_on.trim().is_empty() {
            return Err(invalid("node.listen_on must be non-empty"));
        }
        if n.remote_url.trim().is_empty() {
            return Err(invalid("node.remote_url must be non-empty"));
        }
        if n.address_prefix.trim().is_empty() {
            return Err(invalid("node.address_prefix must be non-empty"));
        }
        parse_coins(&n.gigabyte_prices)?;
        parse_coins(&n.hourly_prices)?;

        let intervals = [
            ("interval_best_rpc_endpoint_secs", n.interval_best_rpc_endpoint_secs),
            ("interval_geoip_location_secs", n.interval_geoip_location_secs),
            (
                "interval_session_usage_sync_with_blockchain_secs",
                n.interval_session_usage_sync_with_blockchain_secs,
            ),
            (
                "interval_session_usage_sync_with_database_secs",
                n.interval_session_usage_sync_with_database_secs,
            ),
            ("interval_session_usage_validate_secs", n.interval_session_usage_validate_secs),
            ("interval_session_validate_secs", n.interval_session_validate_secs),
            ("interval_speedtest_secs", n.interval_speedtest_secs),
            ("interval_status_update_secs", n.interval_status_update_secs),
        ];
        for (name, secs) in intervals {
            if secs == 0 {
                return Err(invalid(format!("node.{} must be greater than zero", name)));
            }
        }

        let q = &self.query;
        if q.rpc_addrs.iter().all(|a| a.trim().is_empty()) {
            return Err(invalid("at least one query.rpc_addrs entry must be provided"));
        }
        if q.timeout_ms == 0 || q.probe_timeout_ms == 0 {
            return Err(invalid("query timeouts must be greater than zero"));
        }

        let t = &self.tx;
        if t.chain_id.trim().is_empty() {
            return Err(invalid("tx.chain_id must not be empty"));
        }
        if t.from_name.trim().is_empty() {
            return Err(invalid("tx.from_name must not be empty"));
        }
        if t.from_address.trim().is_empty() {
            return Err(invalid("tx.from_address must not be empty"));
        }
        if t.gas == 0 {
            return Err(invalid("tx.gas must be greater than zero"));
        }
        if t.gas_adjustment <= 0.0 {
            return Err(invalid("tx.gas_adjustment must be greater than zero"));
        }

        if self.service.kind.trim().is_empty() {
            return Err(invalid("service.type must be non-empty"));
        }
        if self.service.max_peers == 0 {
            return Err(invalid("service.max_peers must be greater than zero"));
        }

        Ok(())
    }
}

/// Load config from a TOML file path.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let s = fs::read_to_string(path.as_ref())?;
    Config::from_toml_str(&s)
}

/// Write config as TOML to `path`, creating parent directories.
pub fn save_to_file(config: &Config, path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let p = path.as_ref();
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(p, config.to_toml_string()?)?;
    Ok(())
}
