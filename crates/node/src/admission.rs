//! # Session Admission
//!
//! Turns a client's access request into a backend peer plus a local
//! session row.
//!
//! ```text
//! request(account, id, key, signature)
//!   │
//!   ├─ chain.query_session(id)        must exist, be Active,
//!   │                                 belong to `account` and this node
//!   ├─ store: id / peer key unused
//!   ├─ peers.add_peer_for_key(key)
//!   └─ store.insert_one(session)      on failure: remove the peer again
//! ```

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::chain::{ChainError, ChainStatus};
use crate::context::NodeContext;
use crate::peer::{AddPeerResponse, PeerError};
use crate::session::{nanos_to_duration, parse_decimal, Session};
use crate::store::{SessionFilter, StoreError};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session {0} does not exist on chain")]
    SessionNotFound(u64),

    #[error("session {id} is {status}, expected active")]
    SessionInactive { id: u64, status: ChainStatus },

    #[error("session {id} belongs to {owner}, not {account}")]
    AccountMismatch { id: u64, owner: String, account: String },

    #[error("session {id} is bound to node {node}")]
    NodeMismatch { id: u64, node: String },

    #[error("session {0} already has a peer")]
    SessionExists(u64),

    #[error("peer key already in use")]
    PeerKeyInUse,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Client request for access under an on-chain session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub account_address: String,
    pub session_id: u64,
    pub peer_key: String,
    /// Base64 client signature.
    pub signature: String,
}

pub async fn create_session_and_add_peer(
    ctx: &NodeContext,
    req: AdmissionRequest,
) -> Result<AddPeerResponse, AdmissionError> {
    if req.session_id == 0 {
        return Err(AdmissionError::InvalidRequest("session id must be non-zero".into()));
    }
    general_purpose::STANDARD
        .decode(&req.signature)
        .map_err(|e| AdmissionError::InvalidRequest(format!("signature: {}", e)))?;
    // normalized form is what the backend reports statistics under
    let peer_key = ctx.peers.request_for_key(&req.peer_key)?.key().to_string();

    let remote = ctx
        .chain
        .query_session(req.session_id)
        .await?
        .ok_or(AdmissionError::SessionNotFound(req.session_id))?;
    if !remote.is_active() {
        return Err(AdmissionError::SessionInactive {
            id: remote.id,
            status: remote.status,
        });
    }
    if remote.account_address != req.account_address {
        return Err(AdmissionError::AccountMismatch {
            id: remote.id,
            owner: remote.account_address,
            account: req.account_address,
        });
    }
    if remote.node_address != ctx.config.node_address {
        return Err(AdmissionError::NodeMismatch {
            id: remote.id,
            node: remote.node_address,
        });
    }

    if ctx.store.find_one(&SessionFilter::by_id(req.session_id))?.is_some() {
        return Err(AdmissionError::SessionExists(req.session_id));
    }
    if ctx.store.find_one(&SessionFilter::by_peer_key(&peer_key))?.is_some() {
        return Err(AdmissionError::PeerKeyInUse);
    }

    let max_bytes = parse_decimal(&remote.max_bytes).ok_or_else(|| {
        ChainError::InvalidResponse(format!("session {} max_bytes '{}'", remote.id, remote.max_bytes))
    })?;

    let (_, res) = ctx.peers.add_peer_for_key(&peer_key).await?;

    let mut session = Session::new(
        remote.id,
        remote.account_address,
        remote.node_address,
        peer_key.clone(),
        ctx.config.service_type,
        Utc::now(),
    )
    .with_max_bytes(&max_bytes)
    .with_max_duration(nanos_to_duration(remote.max_duration));
    session.signature = req.signature;

    if let Err(e) = ctx.store.insert_one(session) {
        warn!(session_id = req.session_id, error = %e, "session insert failed, removing peer");
        if let Err(re) = ctx.peers.remove_peer_if_exists_for_key(&peer_key).await {
            warn!(peer_key = %peer_key, error = %re, "failed to remove peer after insert failure");
        }
        return Err(e.into());
    }

    info!(session_id = req.session_id, peer_key = %peer_key, "session admitted");
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ServiceType;
    use crate::testing::{client_account, wireguard_key, TestNode};

    fn request(id: u64, key: &str) -> AdmissionRequest {
        AdmissionRequest {
            account_address: client_account(id as u8),
            session_id: id,
            peer_key: key.to_string(),
            signature: general_purpose::STANDARD.encode(b"sig"),
        }
    }

    #[tokio::test]
    async fn admits_active_session() {
        let node = TestNode::new(ServiceType::WireGuard);
        node.chain.put_session(node.chain_session(4, &client_account(4), ChainStatus::Active));
        let key = wireguard_key(4);

        create_session_and_add_peer(&node.ctx, request(4, &key)).await.expect("admit");

        assert!(node.backend.contains(&key));
        let s = node.ctx.store.find_one(&SessionFilter::by_id(4)).expect("find").expect("row");
        assert_eq!(s.peer_key, key);
        assert_eq!(s.max_bytes, "1000000000");
        assert_eq!(s.max_duration().as_secs(), 3600);
        assert_eq!(s.signature(), b"sig");
    }

    #[tokio::test]
    async fn v2ray_key_is_stored_normalized() {
        let node = TestNode::new(ServiceType::V2Ray);
        node.chain.put_session(node.chain_session(5, &client_account(5), ChainStatus::Active));

        create_session_and_add_peer(&node.ctx, request(5, "67E55044-10B1-426F-9247-BB680E5FE0C8"))
            .await
            .expect("admit");
        let s = node.ctx.store.find_one(&SessionFilter::by_id(5)).expect("find").expect("row");
        assert_eq!(s.peer_key, "67e55044-10b1-426f-9247-bb680e5fe0c8");
    }

    #[tokio::test]
    async fn rejects_unknown_inactive_and_foreign_sessions() {
        let node = TestNode::new(ServiceType::WireGuard);
        let key = wireguard_key(1);

        let err = create_session_and_add_peer(&node.ctx, request(1, &key)).await.unwrap_err();
        assert!(matches!(err, AdmissionError::SessionNotFound(1)));

        node.chain.put_session(node.chain_session(1, &client_account(1), ChainStatus::InactivePending));
        let err = create_session_and_add_peer(&node.ctx, request(1, &key)).await.unwrap_err();
        assert!(matches!(err, AdmissionError::SessionInactive { .. }));

        node.chain.put_session(node.chain_session(1, &client_account(9), ChainStatus::Active));
        let err = create_session_and_add_peer(&node.ctx, request(1, &key)).await.unwrap_err();
        assert!(matches!(err, AdmissionError::AccountMismatch { .. }));

        let mut other = node.chain_session(1, &client_account(1), ChainStatus::Active);
        other.node_address = "sentnode1other".into();
        node.chain.put_session(other);
        let err = create_session_and_add_peer(&node.ctx, request(1, &key)).await.unwrap_err();
        assert!(matches!(err, AdmissionError::NodeMismatch { .. }));

        assert!(!node.backend.contains(&key));
        assert_eq!(node.ctx.store.count(), 0);
    }

    #[tokio::test]
    async fn rejects_reused_session_or_key() {
        let node = TestNode::new(ServiceType::WireGuard);
        node.chain.put_session(node.chain_session(1, &client_account(1), ChainStatus::Active));
        node.chain.put_session(node.chain_session(2, &client_account(2), ChainStatus::Active));
        let key = wireguard_key(1);

        create_session_and_add_peer(&node.ctx, request(1, &key)).await.expect("admit");

        let err = create_session_and_add_peer(&node.ctx, request(1, &wireguard_key(3))).await.unwrap_err();
        assert!(matches!(err, AdmissionError::SessionExists(1)));

        let err = create_session_and_add_peer(&node.ctx, request(2, &key)).await.unwrap_err();
        assert!(matches!(err, AdmissionError::PeerKeyInUse));
    }

    #[tokio::test]
    async fn failed_insert_removes_peer() {
        let node = TestNode::new(ServiceType::WireGuard);
        // passes every chain-side check, but the ledger rejects the account encoding
        node.chain.put_session(node.chain_session(6, "not-bech32", ChainStatus::Active));
        let key = wireguard_key(6);

        let mut req = request(6, &key);
        req.account_address = "not-bech32".into();
        let err = create_session_and_add_peer(&node.ctx, req).await.unwrap_err();

        assert!(matches!(err, AdmissionError::Store(StoreError::Invalid(_))));
        assert!(!node.backend.contains(&key));
        assert_eq!(node.backend.removal_count(), 1);
    }

    #[tokio::test]
    async fn rejects_malformed_input_before_touching_chain() {
        let node = TestNode::new(ServiceType::WireGuard);
        let mut req = request(1, &wireguard_key(1));
        req.signature = "%%%".into();
        assert!(matches!(
            create_session_and_add_peer(&node.ctx, req).await,
            Err(AdmissionError::InvalidRequest(_))
        ));

        let err = create_session_and_add_peer(&node.ctx, request(1, "short")).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Peer(PeerError::InvalidKey { .. })));
    }
}
