//! # dVPN Node Crate
//!
//! Operating core of a decentralized VPN node: sells metered access to
//! clients and keeps three sources of truth consistent under partial
//! failure.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              Scheduler                               │
//! │   BestRPCAddress  GeoIPLocation  Speedtest  NodeStatusUpdate         │
//! │   SessionUsageSyncWithDatabase   SessionUsageValidate                │
//! │   SessionUsageSyncWithBlockchain SessionValidate                     │
//! └───────────────────────────────┬──────────────────────────────────────┘
//!                                 │ &NodeContext
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ NodeContext                                                          │
//! │   NodeConfig (immutable)      SharedState (RwLock: rpc, geo, speed)  │
//! └──────┬───────────────────────┬───────────────────────┬───────────────┘
//!        ▼                       ▼                       ▼
//! ┌──────────────┐       ┌──────────────┐        ┌──────────────────┐
//! │ PeerAdapter  │       │ SessionStore │        │   ChainClient    │
//! │ (VPN backend)│       │ (sled)       │        │ query / broadcast│
//! └──────────────┘       └──────────────┘        └──────────────────┘
//!   live peers             local ledger             chain ledger
//! ```
//!
//! # Sources of truth
//!
//! | Source | Owner | Reconciled by |
//! |--------|-------|---------------|
//! | backend peer table | [`peer`] | usage validator, reconciler |
//! | local session ledger | [`store`] | usage sync, reconciler |
//! | chain sessions | [`chain`] | usage sync to chain |
//!
//! # Modules
//!
//! - [`scheduler`]: periodic jobs, no self-overlap, graceful stop
//! - [`context`]: static config + dynamic shared state
//! - [`chain`] / [`chain_rpc`]: retrying chain facade and its HTTP transport
//! - [`rpc_selector`]: fastest reachable RPC endpoint
//! - [`session`] / [`store`]: session model and sled ledger
//! - [`jobs`]: the scheduled behaviours
//! - [`peer`] / [`peer_client`]: VPN backend adapter and HTTP sidecar client
//! - [`admission`] / [`api`]: session creation and the admin HTTP surface
//! - [`telemetry`]: GeoIP and speed-test collaborators
//! - `testing`: fully mocked node wiring (`test-util` feature)

pub mod address;
pub mod admission;
pub mod api;
pub mod chain;
pub mod chain_rpc;
pub mod context;
pub mod jobs;
pub mod peer;
pub mod peer_client;
pub mod rpc_selector;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod telemetry;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use admission::{create_session_and_add_peer, AdmissionError, AdmissionRequest};
pub use chain::{ChainClient, ChainError, ChainMsg, ChainPolicies, ChainSession, ChainStatus, ChainTransport};
pub use context::{NodeConfig, NodeConfigBuilder, NodeContext, SharedState};
pub use peer::{PeerAdapter, PeerError, PeerService, ServiceType};
pub use scheduler::{Job, JobAction, JobPanic, Scheduler};
pub use session::Session;
pub use store::{SessionFilter, SessionStore, SessionUpdate, StoreError};
