//! Node-level jobs: liveness heartbeat, best RPC endpoint, GeoIP and
//! speed test.

use anyhow::Result;
use tracing::{info, warn};

use crate::chain::{ChainMsg, ChainStatus, MsgUpdateNodeStatus};
use crate::context::NodeContext;
use crate::rpc_selector;

/// Broadcasts "node status = active".
pub async fn update_status(ctx: &NodeContext) -> Result<()> {
    let msg = ChainMsg::UpdateNodeStatus(MsgUpdateNodeStatus {
        node_address: ctx.config.node_address.clone(),
        status: ChainStatus::Active,
    });
    let res = ctx.chain.broadcast_tx(vec![msg]).await?;
    info!(tx_hash = %res.tx_hash, "node status updated");
    Ok(())
}

/// Publishes the fastest reachable RPC endpoint.
///
/// Returns the selected endpoint, or `None` (state untouched) when no
/// candidate answered.
pub async fn select_rpc_endpoint(ctx: &NodeContext) -> Result<Option<String>> {
    let best = rpc_selector::best_endpoint(
        ctx.prober.as_ref(),
        &ctx.config.rpc_addrs,
        ctx.config.probe_timeout,
    )
    .await;

    match &best {
        Some(addr) => {
            if ctx.state.rpc_addr() != *addr {
                info!(endpoint = %addr, "switching rpc endpoint");
                ctx.state.set_rpc_addr(addr.clone());
            }
        }
        None => warn!(candidates = ctx.config.rpc_addrs.len(), "no rpc endpoint reachable"),
    }
    Ok(best)
}

pub async fn refresh_location(ctx: &NodeContext) -> Result<()> {
    let location = ctx.geoip.resolve().await?;
    info!(ip = %location.ip, country = %location.country_code, city = %location.city, "location updated");
    ctx.state.set_location(location);
    Ok(())
}

pub async fn refresh_speedtest(ctx: &NodeContext) -> Result<()> {
    let result = ctx.speedtest.run().await?;
    info!(download_bps = result.download_bps, upload_bps = result.upload_bps, "speedtest updated");
    ctx.state.set_speedtest(result);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ServiceType;
    use crate::rpc_selector::StaticProber;
    use crate::telemetry::Location;
    use crate::testing::TestNode;
    use std::time::Duration;

    #[tokio::test]
    async fn heartbeat_broadcasts_active_status() {
        let node = TestNode::new(ServiceType::V2Ray);
        update_status(&node.ctx).await.expect("status");

        let sent = node.chain.broadcasts();
        assert_eq!(sent.len(), 1);
        match &sent[0][0] {
            ChainMsg::UpdateNodeStatus(m) => {
                assert_eq!(m.status, ChainStatus::Active);
                assert_eq!(m.node_address, node.ctx.config.node_address);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_job_publishes_fastest_endpoint() {
        let prober = StaticProber::new()
            .with("http://b", Duration::from_millis(200))
            .with("http://c", Duration::from_millis(50));
        let addrs = vec!["http://a".to_string(), "http://b".to_string(), "http://c".to_string()];
        let node = TestNode::with_prober(ServiceType::WireGuard, prober, addrs);

        let best = select_rpc_endpoint(&node.ctx).await.expect("select");
        assert_eq!(best.as_deref(), Some("http://c"));
        assert_eq!(node.ctx.state.rpc_addr(), "http://c");
    }

    #[tokio::test]
    async fn geoip_failure_keeps_previous_location() {
        let node = TestNode::new(ServiceType::WireGuard);
        assert!(refresh_location(&node.ctx).await.is_err());
        assert!(node.ctx.state.location().is_none());

        node.geoip.set(Some(Location {
            country_code: "NL".into(),
            ..Location::default()
        }));
        refresh_location(&node.ctx).await.expect("geoip");
        assert_eq!(node.ctx.state.location().map(|l| l.country_code), Some("NL".into()));
    }
}
