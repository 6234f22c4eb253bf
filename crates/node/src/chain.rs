//! # Blockchain Facade
//!
//! Query-with-retry and broadcast-with-retry over a pluggable
//! [`ChainTransport`].
//!
//! ## Architecture
//!
//! ```text
//! jobs / admission
//!      │
//!      ▼
//! ChainClient
//!      ├─ query(op)          retry(query_policy)              (not serialized)
//!      └─ broadcast_tx(msgs)
//!           ├─ tx_lock        one submission at a time per account
//!           ├─ submit         retry(broadcast_policy)
//!           │                   AlreadyInMempool { hash } ⇒ submitted
//!           │                   code != 0                 ⇒ attempt failed
//!           └─ confirm        retry(confirm_policy) on query_tx(hash)
//!      │
//!      ▼
//! dyn ChainTransport (HTTP gateway, mock)
//! ```
//!
//! ## Mempool duplicates
//!
//! A submission rejected because the same signed transaction already sits
//! in the node's pending pool is forward progress, not failure. The
//! transport reports it as [`ChainError::AlreadyInMempool`] carrying the
//! hash of the bytes it submitted, and the facade goes straight to
//! confirmation polling with that hash. No response code is inspected on
//! that path.
//!
//! ## Failure semantics
//!
//! Exhausted submission retries, exhausted confirmation polling and a
//! non-OK execution result all surface as errors. Callers are scheduled
//! jobs; they log the error and try again on their next tick.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dvpn_common::{retry, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// ABCI success code.
pub const CODE_OK: u32 = 0;

/// Substring the chain node uses for duplicate mempool submissions.
pub const MEMPOOL_CACHE_ERROR: &str = "tx already exists in cache";

// ════════════════════════════════════════════════════════════════════════════
// CHAIN TYPES
// ════════════════════════════════════════════════════════════════════════════

/// On-chain status of a session or node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Unspecified,
    Active,
    InactivePending,
    Inactive,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainStatus::Unspecified => "unspecified",
            ChainStatus::Active => "active",
            ChainStatus::InactivePending => "inactive_pending",
            ChainStatus::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

/// Canonical session record as stored on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSession {
    pub id: u64,
    pub account_address: String,
    pub node_address: String,
    /// Decimal string.
    pub download_bytes: String,
    /// Decimal string.
    pub upload_bytes: String,
    /// Decimal string.
    pub max_bytes: String,
    /// Nanoseconds.
    pub duration: i64,
    /// Nanoseconds.
    pub max_duration: i64,
    pub status: ChainStatus,
}

impl ChainSession {
    pub fn is_active(&self) -> bool {
        self.status == ChainStatus::Active
    }
}

/// Usage report for one session, signed by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgUpdateSession {
    pub node_address: String,
    pub session_id: u64,
    /// Decimal string.
    pub download_bytes: String,
    /// Decimal string.
    pub upload_bytes: String,
    /// Nanoseconds.
    pub duration: i64,
    /// Base64 client signature.
    pub signature: String,
}

/// Node liveness / status update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgUpdateNodeStatus {
    pub node_address: String,
    pub status: ChainStatus,
}

/// Messages this node emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainMsg {
    UpdateSession(MsgUpdateSession),
    UpdateNodeStatus(MsgUpdateNodeStatus),
}

/// Result of handing a transaction to the chain node (mempool admission).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    pub tx_hash: String,
    pub code: u32,
    #[serde(default)]
    pub log: String,
}

impl TxResponse {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Result of a transaction included in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    pub tx_hash: String,
    pub height: u64,
    pub code: u32,
    #[serde(default)]
    pub log: String,
}

impl TxResult {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Network or RPC level failure.
    #[error("chain transport error: {0}")]
    Transport(String),

    /// The identical transaction is already in the node's pending pool.
    #[error("transaction {tx_hash} already in mempool")]
    AlreadyInMempool { tx_hash: String },

    /// The chain executed (or checked) the transaction and refused it.
    #[error("transaction rejected (code {code}): {log}")]
    Rejected { code: u32, log: String },

    /// The transaction is not (yet) indexed.
    #[error("transaction {0} not found")]
    TxNotFound(String),

    #[error("invalid chain response: {0}")]
    InvalidResponse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ChainError {
    /// Classifies a raw broadcast error message.
    pub fn from_broadcast_message(msg: &str, tx_hash: Option<&str>) -> Self {
        match tx_hash {
            Some(hash) if msg.to_lowercase().contains(MEMPOOL_CACHE_ERROR) => {
                ChainError::AlreadyInMempool {
                    tx_hash: hash.to_string(),
                }
            }
            _ => ChainError::Transport(msg.to_string()),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TRANSPORT TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Async transport abstraction for chain interaction.
///
/// ## Contract
///
/// - Implementations MUST NOT retry internally.
/// - `query_session` returns `Ok(None)` when the chain has no such session.
/// - `broadcast_tx` signs and submits; a duplicate-mempool rejection MUST be
///   reported as [`ChainError::AlreadyInMempool`] with the submitted hash.
/// - `query_tx` returns [`ChainError::TxNotFound`] while the transaction is
///   not yet included.
#[async_trait]
pub trait ChainTransport: Send + Sync {
    async fn query_session(&self, id: u64) -> Result<Option<ChainSession>, ChainError>;

    async fn broadcast_tx(&self, msgs: &[ChainMsg]) -> Result<TxResponse, ChainError>;

    async fn query_tx(&self, tx_hash: &str) -> Result<TxResult, ChainError>;
}

// ════════════════════════════════════════════════════════════════════════════
// CLIENT
// ════════════════════════════════════════════════════════════════════════════

/// Retry budgets used by [`ChainClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPolicies {
    pub query: RetryPolicy,
    pub broadcast: RetryPolicy,
    pub confirm: RetryPolicy,
}

impl Default for ChainPolicies {
    fn default() -> Self {
        Self {
            query: RetryPolicy::from_millis(5, 1000),
            broadcast: RetryPolicy::from_millis(5, 6000),
            confirm: RetryPolicy::from_millis(60, 1000),
        }
    }
}

/// Blockchain facade shared by all jobs.
pub struct ChainClient {
    transport: Arc<dyn ChainTransport>,
    policies: ChainPolicies,
    /// Serializes submissions from this node's account.
    tx_lock: tokio::sync::Mutex<()>,
}

impl ChainClient {
    pub fn new(transport: Arc<dyn ChainTransport>, policies: ChainPolicies) -> Self {
        Self {
            transport,
            policies,
            tx_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn policies(&self) -> ChainPolicies {
        self.policies
    }

    /// Runs a read-only chain call under the query retry budget.
    pub async fn query<T, F, Fut>(&self, op: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        retry(self.policies.query, op).await
    }

    /// Fetches a session by id; `Ok(None)` when the chain has forgotten it.
    pub async fn query_session(&self, id: u64) -> Result<Option<ChainSession>, ChainError> {
        let transport = self.transport.clone();
        self.query(|| {
            let transport = transport.clone();
            async move { transport.query_session(id).await }
        })
        .await
    }

    /// Submits `msgs` as one transaction and waits for its inclusion.
    pub async fn broadcast_tx(&self, msgs: Vec<ChainMsg>) -> Result<TxResult, ChainError> {
        if msgs.is_empty() {
            return Err(ChainError::InvalidRequest("transaction has no messages".to_string()));
        }

        let tx_hash = {
            let _guard = self.tx_lock.lock().await;
            self.submit(&msgs).await?
        };
        debug!(tx_hash = %tx_hash, messages = msgs.len(), "transaction submitted");

        let transport = self.transport.clone();
        let hash = tx_hash.clone();
        let result = retry(self.policies.confirm, || {
            let transport = transport.clone();
            let hash = hash.clone();
            async move { transport.query_tx(&hash).await }
        })
        .await?;

        if !result.is_ok() {
            warn!(tx_hash = %tx_hash, code = result.code, log = %result.log, "transaction failed");
            return Err(ChainError::Rejected {
                code: result.code,
                log: result.log,
            });
        }

        info!(tx_hash = %tx_hash, height = result.height, "transaction confirmed");
        Ok(result)
    }

    async fn submit(&self, msgs: &[ChainMsg]) -> Result<String, ChainError> {
        let transport = self.transport.clone();
        retry(self.policies.broadcast, || {
            let transport = transport.clone();
            async move {
                match transport.broadcast_tx(msgs).await {
                    Ok(resp) if resp.is_ok() => Ok(resp.tx_hash),
                    Ok(resp) => Err(ChainError::Rejected {
                        code: resp.code,
                        log: resp.log,
                    }),
                    Err(ChainError::AlreadyInMempool { tx_hash }) => {
                        info!(tx_hash = %tx_hash, "transaction already in mempool");
                        Ok(tx_hash)
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MOCK TRANSPORT
// ════════════════════════════════════════════════════════════════════════════

#[cfg(any(test, feature = "test-util"))]
pub use mock::MockChainTransport;

#[cfg(any(test, feature = "test-util"))]
mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    /// In-memory chain used by tests and dry runs.
    ///
    /// - Sessions are kept in a map; unknown ids return `Ok(None)`.
    /// - Broadcast outcomes are pre-loaded FIFO; when none remain the
    ///   broadcast succeeds with a fresh hash.
    /// - Every submitted transaction is confirmed with code 0 unless
    ///   overridden via [`set_tx_result`](Self::set_tx_result).
    #[derive(Default)]
    pub struct MockChainTransport {
        sessions: Mutex<HashMap<u64, ChainSession>>,
        broadcast_outcomes: Mutex<VecDeque<Result<TxResponse, ChainError>>>,
        tx_results: Mutex<HashMap<String, TxResult>>,
        broadcasts: Mutex<Vec<Vec<ChainMsg>>>,
        query_failures: AtomicUsize,
        pending_polls: AtomicUsize,
        broadcast_delay: Mutex<Option<Duration>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        next_hash: AtomicU64,
    }

    impl MockChainTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put_session(&self, session: ChainSession) {
            self.sessions.lock().insert(session.id, session);
        }

        pub fn remove_session(&self, id: u64) {
            self.sessions.lock().remove(&id);
        }

        pub fn set_session_status(&self, id: u64, status: ChainStatus) {
            if let Some(s) = self.sessions.lock().get_mut(&id) {
                s.status = status;
            }
        }

        /// Queues the outcome of the next broadcast attempt.
        pub fn push_broadcast_outcome(&self, outcome: Result<TxResponse, ChainError>) {
            self.broadcast_outcomes.lock().push_back(outcome);
        }

        pub fn set_tx_result(&self, result: TxResult) {
            self.tx_results.lock().insert(result.tx_hash.clone(), result);
        }

        /// The next `n` session queries fail with a transport error.
        pub fn fail_next_queries(&self, n: usize) {
            self.query_failures.store(n, Ordering::SeqCst);
        }

        /// The next `n` `query_tx` polls report the transaction as not found.
        pub fn pending_polls(&self, n: usize) {
            self.pending_polls.store(n, Ordering::SeqCst);
        }

        /// Makes every broadcast attempt take `delay`.
        pub fn set_broadcast_delay(&self, delay: Duration) {
            *self.broadcast_delay.lock() = Some(delay);
        }

        /// Message batches of every broadcast attempt, in order.
        pub fn broadcasts(&self) -> Vec<Vec<ChainMsg>> {
            self.broadcasts.lock().clone()
        }

        /// Highest number of broadcast attempts observed running at once.
        pub fn max_concurrent_broadcasts(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn take_countdown(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl ChainTransport for MockChainTransport {
        async fn query_session(&self, id: u64) -> Result<Option<ChainSession>, ChainError> {
            if Self::take_countdown(&self.query_failures) {
                return Err(ChainError::Transport("mock query failure".to_string()));
            }
            Ok(self.sessions.lock().get(&id).cloned())
        }

        async fn broadcast_tx(&self, msgs: &[ChainMsg]) -> Result<TxResponse, ChainError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = *self.broadcast_delay.lock();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }

            self.broadcasts.lock().push(msgs.to_vec());
            let outcome = self.broadcast_outcomes.lock().pop_front();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match outcome {
                Some(o) => o,
                None => {
                    let n = self.next_hash.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(TxResponse {
                        tx_hash: format!("{:064X}", n),
                        code: CODE_OK,
                        log: String::new(),
                    })
                }
            }
        }

        async fn query_tx(&self, tx_hash: &str) -> Result<TxResult, ChainError> {
            if Self::take_countdown(&self.pending_polls) {
                return Err(ChainError::TxNotFound(tx_hash.to_string()));
            }
            Ok(self
                .tx_results
                .lock()
                .get(tx_hash)
                .cloned()
                .unwrap_or_else(|| TxResult {
                    tx_hash: tx_hash.to_string(),
                    height: 1,
                    code: CODE_OK,
                    log: String::new(),
                }))
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// COMPILE-TIME ASSERTIONS
// ════════════════════════════════════════════════════════════════════════════

const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn check() {
        assert_send_sync::<ChainClient>();
        #[cfg(any(test, feature = "test-util"))]
        assert_send_sync::<MockChainTransport>();
    }
    let _ = check;
};

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status_msg() -> ChainMsg {
        ChainMsg::UpdateNodeStatus(MsgUpdateNodeStatus {
            node_address: "sentnode1test".to_string(),
            status: ChainStatus::Active,
        })
    }

    fn session(id: u64, status: ChainStatus) -> ChainSession {
        ChainSession {
            id,
            account_address: "sent1acc".to_string(),
            node_address: "sentnode1node".to_string(),
            download_bytes: "0".to_string(),
            upload_bytes: "0".to_string(),
            max_bytes: "1000".to_string(),
            duration: 0,
            max_duration: 3_600_000_000_000,
            status,
        }
    }

    fn client(mock: Arc<MockChainTransport>) -> ChainClient {
        ChainClient::new(mock, ChainPolicies::default())
    }

    // ── Queries ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn query_session_absorbs_transient_failures() {
        let mock = Arc::new(MockChainTransport::new());
        mock.put_session(session(1, ChainStatus::Active));
        mock.fail_next_queries(4);

        let found = client(mock).query_session(1).await.expect("query");
        assert_eq!(found.map(|s| s.id), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn query_session_surfaces_error_after_budget() {
        let mock = Arc::new(MockChainTransport::new());
        mock.fail_next_queries(5);

        let err = client(mock).query_session(1).await.unwrap_err();
        assert!(matches!(err, ChainError::Transport(_)));
    }

    #[tokio::test]
    async fn query_session_absent_is_none() {
        let mock = Arc::new(MockChainTransport::new());
        assert_eq!(client(mock).query_session(42).await, Ok(None));
    }

    // ── Broadcast ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn broadcast_confirms_after_pending_polls() {
        let mock = Arc::new(MockChainTransport::new());
        mock.pending_polls(10);

        let res = client(mock.clone()).broadcast_tx(vec![status_msg()]).await.expect("broadcast");
        assert!(res.is_ok());
        assert_eq!(mock.broadcasts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_mempool_duplicate_is_success() {
        let mock = Arc::new(MockChainTransport::new());
        mock.push_broadcast_outcome(Err(ChainError::AlreadyInMempool {
            tx_hash: "ABCD".to_string(),
        }));

        let res = client(mock.clone()).broadcast_tx(vec![status_msg()]).await.expect("broadcast");
        assert_eq!(res.tx_hash, "ABCD");
        assert_eq!(mock.broadcasts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_retries_rejection_then_succeeds() {
        let mock = Arc::new(MockChainTransport::new());
        mock.push_broadcast_outcome(Ok(TxResponse {
            tx_hash: "BAD".to_string(),
            code: 32,
            log: "account sequence mismatch".to_string(),
        }));
        mock.push_broadcast_outcome(Err(ChainError::Transport("connection reset".to_string())));

        let res = client(mock.clone()).broadcast_tx(vec![status_msg()]).await.expect("broadcast");
        assert!(res.is_ok());
        assert_eq!(mock.broadcasts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_fails_after_five_rejections() {
        let mock = Arc::new(MockChainTransport::new());
        for _ in 0..5 {
            mock.push_broadcast_outcome(Ok(TxResponse {
                tx_hash: "BAD".to_string(),
                code: 5,
                log: "insufficient funds".to_string(),
            }));
        }

        let err = client(mock.clone()).broadcast_tx(vec![status_msg()]).await.unwrap_err();
        assert_eq!(
            err,
            ChainError::Rejected {
                code: 5,
                log: "insufficient funds".to_string()
            }
        );
        assert_eq!(mock.broadcasts().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_confirmation_timeout_is_error() {
        let mock = Arc::new(MockChainTransport::new());
        mock.pending_polls(60);

        let err = client(mock).broadcast_tx(vec![status_msg()]).await.unwrap_err();
        assert!(matches!(err, ChainError::TxNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_failed_execution_is_error() {
        let mock = Arc::new(MockChainTransport::new());
        mock.push_broadcast_outcome(Ok(TxResponse {
            tx_hash: "EXEC".to_string(),
            code: CODE_OK,
            log: String::new(),
        }));
        mock.set_tx_result(TxResult {
            tx_hash: "EXEC".to_string(),
            height: 10,
            code: 11,
            log: "out of gas".to_string(),
        });

        let err = client(mock).broadcast_tx(vec![status_msg()]).await.unwrap_err();
        assert!(matches!(err, ChainError::Rejected { code: 11, .. }));
    }

    #[tokio::test]
    async fn broadcast_rejects_empty_batch() {
        let mock = Arc::new(MockChainTransport::new());
        let err = client(mock.clone()).broadcast_tx(vec![]).await.unwrap_err();
        assert!(matches!(err, ChainError::InvalidRequest(_)));
        assert!(mock.broadcasts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_broadcasts_are_serialized() {
        let mock = Arc::new(MockChainTransport::new());
        mock.set_broadcast_delay(Duration::from_millis(500));
        let client = Arc::new(client(mock.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = client.clone();
            handles.push(tokio::spawn(async move { c.broadcast_tx(vec![status_msg()]).await }));
        }
        for h in handles {
            h.await.expect("join").expect("broadcast");
        }

        assert_eq!(mock.broadcasts().len(), 4);
        assert_eq!(mock.max_concurrent_broadcasts(), 1);
    }

    #[test]
    fn mempool_message_classification() {
        let e = ChainError::from_broadcast_message("Tx Already Exists In Cache", Some("FF"));
        assert_eq!(e, ChainError::AlreadyInMempool { tx_hash: "FF".to_string() });

        let e = ChainError::from_broadcast_message("tx already exists in cache", None);
        assert!(matches!(e, ChainError::Transport(_)));

        let e = ChainError::from_broadcast_message("timeout", Some("FF"));
        assert!(matches!(e, ChainError::Transport(_)));
    }
}
