//! # Session Store
//!
//! Persisted session ledger backed by sled.
//!
//! ## Layout
//!
//! ```text
//! sled::Db
//!  ├─ "sessions"   id (u64 big-endian)  → Session (JSON)
//!  └─ "peer_keys"  peer key (utf-8)     → id (u64 big-endian)
//! ```
//!
//! Big-endian ids keep iteration in ascending id order. The `peer_keys`
//! tree is the unique index on `peer_key`; both trees are only ever
//! written together inside one sled transaction.
//!
//! ## Addressing
//!
//! Every operation takes a [`SessionFilter`]. A filter with `id` or
//! `peer_key` resolves through the primary key or the index; anything
//! else scans. `find_one` on no match returns `Ok(None)`, never an error.
//!
//! ## Usage updates
//!
//! A [`SessionUpdate`] that carries byte counters is applied with
//! [`Session::apply_usage`] inside the same transaction that reads the
//! row, so `duration` is always recomputed together with the counters it
//! belongs to.

use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Transactional;
use thiserror::Error;
use tracing::debug;

use crate::peer::ServiceType;
use crate::session::{Session, SessionError};

const SESSIONS_TREE: &str = "sessions";
const PEER_KEYS_TREE: &str = "peer_keys";

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("failed to encode or decode session: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("session with {field} '{value}' already exists")]
    Duplicate { field: &'static str, value: String },

    #[error("invalid session: {0}")]
    Invalid(#[from] SessionError),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),
}

type TxResult<T> = Result<T, ConflictableTransactionError<StoreError>>;

fn abort<T>(e: impl Into<StoreError>) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(e.into()))
}

fn unwrap_tx<T>(res: Result<T, TransactionError<StoreError>>) -> Result<T, StoreError> {
    res.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Sled(e),
    })
}

// ════════════════════════════════════════════════════════════════════════════
// FILTER / UPDATE
// ════════════════════════════════════════════════════════════════════════════

/// Field-equality filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub id: Option<u64>,
    pub peer_key: Option<String>,
    pub account_address: Option<String>,
    pub service_type: Option<ServiceType>,
}

impl SessionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: u64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_peer_key(key: impl Into<String>) -> Self {
        Self {
            peer_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn by_account(addr: impl Into<String>) -> Self {
        Self {
            account_address: Some(addr.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, s: &Session) -> bool {
        self.id.map_or(true, |id| s.id == id)
            && self.peer_key.as_deref().map_or(true, |k| s.peer_key == k)
            && self
                .account_address
                .as_deref()
                .map_or(true, |a| s.account_address == a)
            && self.service_type.map_or(true, |t| s.service_type == t)
    }
}

/// Field changes applied by the update operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub download_bytes: Option<BigUint>,
    pub upload_bytes: Option<BigUint>,
    /// Base64.
    pub signature: Option<String>,
    /// Wall clock used for `duration` and `updated_at`.
    pub now: DateTime<Utc>,
}

impl SessionUpdate {
    pub fn usage(download_bytes: BigUint, upload_bytes: BigUint) -> Self {
        Self {
            download_bytes: Some(download_bytes),
            upload_bytes: Some(upload_bytes),
            signature: None,
            now: Utc::now(),
        }
    }

    pub fn signature(signature: impl Into<String>) -> Self {
        Self {
            download_bytes: None,
            upload_bytes: None,
            signature: Some(signature.into()),
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    fn validate(&self) -> Result<(), StoreError> {
        if let Some(sig) = &self.signature {
            general_purpose::STANDARD
                .decode(sig)
                .map_err(|e| StoreError::InvalidUpdate(format!("signature: {}", e)))?;
        }
        Ok(())
    }

    fn apply(&self, s: &mut Session) {
        s.apply_usage(self.download_bytes.as_ref(), self.upload_bytes.as_ref(), self.now);
        if let Some(sig) = &self.signature {
            s.signature = sig.clone();
        }
        s.updated_at = self.now;
    }
}

// ════════════════════════════════════════════════════════════════════════════
// STORE
// ════════════════════════════════════════════════════════════════════════════

/// Session ledger. Cheap to clone; clones share the database.
#[derive(Clone)]
pub struct SessionStore {
    db: sled::Db,
    sessions: sled::Tree,
    peer_keys: sled::Tree,
}

impl SessionStore {
    /// Opens (or creates) the ledger at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(db)
    }

    /// Ledger that lives only as long as the process.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let sessions = db.open_tree(SESSIONS_TREE)?;
        let peer_keys = db.open_tree(PEER_KEYS_TREE)?;
        Ok(Self {
            db,
            sessions,
            peer_keys,
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    // ────────────────────────────────────────────────────────────────────
    // Reads
    // ────────────────────────────────────────────────────────────────────

    pub fn find_one(&self, filter: &SessionFilter) -> Result<Option<Session>, StoreError> {
        Ok(self.find(filter)?.into_iter().next())
    }

    /// All matching sessions in ascending id order.
    pub fn find(&self, filter: &SessionFilter) -> Result<Vec<Session>, StoreError> {
        if let Some(id) = self.indexed_id(filter)? {
            return match id {
                Some(id) => Ok(self
                    .get(id)?
                    .filter(|s| filter.matches(s))
                    .into_iter()
                    .collect()),
                None => Ok(Vec::new()),
            };
        }

        let mut out = Vec::new();
        for item in self.sessions.iter() {
            let (_, value) = item?;
            let s: Session = serde_json::from_slice(&value)?;
            if filter.matches(&s) {
                out.push(s);
            }
        }
        Ok(out)
    }

    fn get(&self, id: u64) -> Result<Option<Session>, StoreError> {
        match self.sessions.get(id.to_be_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    /// Resolves `id` / `peer_key` filters without scanning.
    ///
    /// Outer `None`: the filter has no indexed field. Inner `None`: the
    /// indexed lookup found nothing.
    fn indexed_id(&self, filter: &SessionFilter) -> Result<Option<Option<u64>>, StoreError> {
        if let Some(id) = filter.id {
            return Ok(Some(Some(id)));
        }
        if let Some(key) = &filter.peer_key {
            let id = self.peer_keys.get(key.as_bytes())?.map(|v| decode_id(&v));
            return Ok(Some(id));
        }
        Ok(None)
    }

    fn matching_ids(&self, filter: &SessionFilter) -> Result<Vec<u64>, StoreError> {
        Ok(self.find(filter)?.into_iter().map(|s| s.id).collect())
    }

    // ────────────────────────────────────────────────────────────────────
    // Writes
    // ────────────────────────────────────────────────────────────────────

    pub fn insert_one(&self, session: Session) -> Result<(), StoreError> {
        self.insert_many(vec![session])
    }

    /// Inserts all sessions or none.
    pub fn insert_many(&self, sessions: Vec<Session>) -> Result<(), StoreError> {
        let mut encoded = Vec::with_capacity(sessions.len());
        for s in &sessions {
            s.validate()?;
            encoded.push((s.id, s.peer_key.clone(), serde_json::to_vec(s)?));
        }

        unwrap_tx((&self.sessions, &self.peer_keys).transaction(|(tx_sessions, tx_keys)| {
            for (id, peer_key, value) in &encoded {
                let key = id.to_be_bytes();
                if tx_sessions.get(&key[..])?.is_some() {
                    return abort(StoreError::Duplicate {
                        field: "id",
                        value: id.to_string(),
                    });
                }
                if tx_keys.get(peer_key.as_bytes())?.is_some() {
                    return abort(StoreError::Duplicate {
                        field: "peer_key",
                        value: peer_key.clone(),
                    });
                }
                tx_sessions.insert(&key[..], value.as_slice())?;
                tx_keys.insert(peer_key.as_bytes(), &key[..])?;
            }
            Ok(())
        }))?;

        debug!(count = sessions.len(), "sessions inserted");
        Ok(())
    }

    /// Updates the first matching session and returns it as written.
    pub fn find_one_and_update(
        &self,
        filter: &SessionFilter,
        update: &SessionUpdate,
    ) -> Result<Option<Session>, StoreError> {
        update.validate()?;
        let id = match self.matching_ids(filter)?.into_iter().next() {
            Some(id) => id,
            None => return Ok(None),
        };
        let mut updated = self.update_ids(&[id], filter, update)?;
        Ok(updated.pop())
    }

    /// Updates every matching session; returns how many were written.
    pub fn update_many(
        &self,
        filter: &SessionFilter,
        update: &SessionUpdate,
    ) -> Result<usize, StoreError> {
        update.validate()?;
        let ids = self.matching_ids(filter)?;
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(self.update_ids(&ids, filter, update)?.len())
    }

    fn update_ids(
        &self,
        ids: &[u64],
        filter: &SessionFilter,
        update: &SessionUpdate,
    ) -> Result<Vec<Session>, StoreError> {
        unwrap_tx(self.sessions.transaction(|tx| {
            let mut written = Vec::with_capacity(ids.len());
            for id in ids {
                let key = id.to_be_bytes();
                let mut s = match read_tx(tx, &key)? {
                    Some(s) if filter.matches(&s) => s,
                    // removed or changed since the lookup
                    _ => continue,
                };
                update.apply(&mut s);
                let value = match serde_json::to_vec(&s) {
                    Ok(v) => v,
                    Err(e) => return abort(e),
                };
                tx.insert(&key[..], value)?;
                written.push(s);
            }
            Ok(written)
        }))
    }

    /// Removes the first matching session and returns it.
    pub fn find_one_and_delete(&self, filter: &SessionFilter) -> Result<Option<Session>, StoreError> {
        let id = match self.matching_ids(filter)?.into_iter().next() {
            Some(id) => id,
            None => return Ok(None),
        };
        Ok(self.delete_ids(&[id])?.pop())
    }

    /// Removes every matching session; returns how many were removed.
    pub fn delete_many(&self, filter: &SessionFilter) -> Result<usize, StoreError> {
        let ids = self.matching_ids(filter)?;
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(self.delete_ids(&ids)?.len())
    }

    fn delete_ids(&self, ids: &[u64]) -> Result<Vec<Session>, StoreError> {
        let removed = unwrap_tx((&self.sessions, &self.peer_keys).transaction(|(tx_sessions, tx_keys)| {
            let mut removed = Vec::with_capacity(ids.len());
            for id in ids {
                let key = id.to_be_bytes();
                if let Some(s) = read_tx(tx_sessions, &key)? {
                    tx_sessions.remove(&key[..])?;
                    tx_keys.remove(s.peer_key.as_bytes())?;
                    removed.push(s);
                }
            }
            Ok(removed)
        }))?;
        debug!(count = removed.len(), "sessions deleted");
        Ok(removed)
    }
}

fn read_tx(tx: &TransactionalTree, key: &[u8]) -> TxResult<Option<Session>> {
    match tx.get(key)? {
        Some(v) => match serde_json::from_slice(&v) {
            Ok(s) => Ok(Some(s)),
            Err(e) => abort(e),
        },
        None => Ok(None),
    }
}

fn decode_id(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    u64::from_be_bytes(buf)
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
