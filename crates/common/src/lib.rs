//! # dVPN Common Crate
//!
//! Utilities shared by the node binary and its library.
//!
//! ## Modules
//! - `config`: TOML configuration file model, loader and validation
//! - `retry`: bounded fixed-backoff async retry combinator
//!
//! ## Usage
//! ```rust,ignore
//! let cfg = dvpn_common::config::load_from_file(home.join("config.toml"))?;
//! cfg.validate()?;
//!
//! let policy = RetryPolicy::from_millis(cfg.query.max_retries, cfg.query.retry_delay_ms);
//! let value = retry(policy, || client.query()).await?;
//! ```

pub mod config;
pub mod retry;

pub use config::{Coin, Config, ConfigError};
pub use retry::{retry, RetryPolicy};
