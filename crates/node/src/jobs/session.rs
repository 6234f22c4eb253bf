//! # Session Lifecycle Jobs
//!
//! Four independent behaviours over the local ledger, the VPN backend and
//! the chain:
//!
//! | Job | Reads | Writes |
//! |---|---|---|
//! | usage sync → database | backend statistics | session counters (+ duration) |
//! | usage validator | local sessions | backend (peer removal) |
//! | usage sync → chain | local sessions, chain sessions | one batched tx |
//! | reconciler | local sessions, chain sessions | backend, local ledger |
//!
//! The validator never deletes rows. Quota exhaustion tears the peer
//! down; the row goes away once the chain forgets the session and the
//! reconciler sees it.
//!
//! The validator and the reconciler treat each session on its own: a
//! failure is logged and the pass moves on, then the tick reports how many
//! sessions failed so the scheduler logs it.

use anyhow::{bail, Result};
use num_bigint::BigUint;
use tracing::{debug, info, warn};

use crate::context::NodeContext;
use crate::session::Session;
use crate::store::{SessionFilter, SessionUpdate};

/// Copies backend usage counters into matching sessions.
///
/// Backend keys are normalized the same way admission normalizes them
/// before the ledger lookup. Returns the number of sessions updated. Peers
/// without a local session, or with a key the backend type rejects, are
/// skipped.
pub async fn sync_usage_with_database(ctx: &NodeContext) -> Result<usize> {
    let stats = ctx.peers.peer_statistics().await?;
    let mut updated = 0;

    for stat in stats {
        let key = match ctx.peers.request_for_key(&stat.key) {
            Ok(req) => req.key().to_string(),
            Err(e) => {
                debug!(peer_key = %stat.key, error = %e, "unparseable peer key in statistics, skipping");
                continue;
            }
        };
        let update = SessionUpdate::usage(
            BigUint::from(stat.download_bytes),
            BigUint::from(stat.upload_bytes),
        );
        match ctx
            .store
            .find_one_and_update(&SessionFilter::by_peer_key(&key), &update)?
        {
            Some(_) => updated += 1,
            None => debug!(peer_key = %key, "no session for peer, skipping"),
        }
    }
    Ok(updated)
}

/// Removes backend peers of sessions that reached their byte or time quota.
///
/// Returns the number of sessions over quota. A failed removal does not
/// stop the pass; the tick fails afterwards if any removal failed.
pub async fn validate_usage(ctx: &NodeContext) -> Result<usize> {
    let sessions = ctx.store.find(&SessionFilter::all())?;
    let mut exceeded = 0;
    let mut failed = 0;

    for s in sessions {
        if !s.is_quota_exceeded() {
            continue;
        }
        exceeded += 1;
        info!(session_id = s.id, peer_key = %s.peer_key, "session quota exceeded, removing peer");
        if let Err(e) = ctx.peers.remove_peer_if_exists_for_key(&s.peer_key).await {
            warn!(session_id = s.id, peer_key = %s.peer_key, error = %e, "failed to remove peer");
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} of {} over-quota sessions could not be torn down", failed, exceeded);
    }
    Ok(exceeded)
}

/// Reports usage of every session the chain still knows in one transaction.
///
/// Returns the number of messages broadcast; zero means no transaction.
pub async fn sync_usage_with_blockchain(ctx: &NodeContext) -> Result<usize> {
    let sessions = ctx.store.find(&SessionFilter::all())?;
    let mut msgs = Vec::with_capacity(sessions.len());

    for s in sessions {
        if ctx.chain.query_session(s.id).await?.is_none() {
            debug!(session_id = s.id, "session not on chain, skipping usage update");
            continue;
        }
        msgs.push(s.update_usage_msg());
    }

    if msgs.is_empty() {
        return Ok(0);
    }
    let count = msgs.len();
    let res = ctx.chain.broadcast_tx(msgs).await?;
    info!(tx_hash = %res.tx_hash, sessions = count, "session usage reported");
    Ok(count)
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Sessions whose peer was torn down (absent or inactive on chain).
    pub peers_removed: usize,
    /// Rows deleted because the chain no longer has the session.
    pub rows_deleted: usize,
}

/// Aligns local sessions with the chain's view.
///
/// - absent on chain: remove peer, delete row
/// - present but not active: remove peer, keep row
///
/// A session that fails is logged and left for the next tick; the others
/// are still reconciled. The tick fails afterwards if any session failed.
pub async fn validate_sessions(ctx: &NodeContext) -> Result<Reconciled> {
    let sessions = ctx.store.find(&SessionFilter::all())?;
    let total = sessions.len();
    let mut out = Reconciled::default();
    let mut failed = 0;

    for s in sessions {
        if let Err(e) = reconcile_one(ctx, &s, &mut out).await {
            warn!(session_id = s.id, peer_key = %s.peer_key, error = %e, "failed to reconcile session");
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} of {} sessions could not be reconciled", failed, total);
    }
    Ok(out)
}

async fn reconcile_one(ctx: &NodeContext, s: &Session, out: &mut Reconciled) -> Result<()> {
    let remote = ctx.chain.query_session(s.id).await?;
    if remote.as_ref().map_or(true, |r| !r.is_active()) {
        info!(
            session_id = s.id,
            peer_key = %s.peer_key,
            status = %remote.as_ref().map_or("absent".to_string(), |r| r.status.to_string()),
            "session not active on chain, removing peer"
        );
        ctx.peers.remove_peer_if_exists_for_key(&s.peer_key).await?;
        out.peers_removed += 1;
    }
    if remote.is_none() {
        ctx.store.find_one_and_delete(&SessionFilter::by_id(s.id))?;
        out.rows_deleted += 1;
    }
    Ok(())
}
