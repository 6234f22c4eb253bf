//! Scheduled jobs.
//!
//! Every job handler is a plain `async fn(&NodeContext)`; [`all`] wraps
//! them into [`Job`]s with the configured intervals. All jobs use the
//! default continue-on-error policy: a failure is logged and the job runs
//! again on its next tick.

pub mod node;
pub mod session;

use crate::context::NodeContext;
use crate::scheduler::Job;

pub const BEST_RPC_ADDRESS: &str = "BestRPCAddress";
pub const GEOIP_LOCATION: &str = "GeoIPLocation";
pub const SESSION_USAGE_SYNC_WITH_BLOCKCHAIN: &str = "SessionUsageSyncWithBlockchain";
pub const SESSION_USAGE_SYNC_WITH_DATABASE: &str = "SessionUsageSyncWithDatabase";
pub const SESSION_USAGE_VALIDATE: &str = "SessionUsageValidate";
pub const SESSION_VALIDATE: &str = "SessionValidate";
pub const SPEEDTEST: &str = "Speedtest";
pub const NODE_STATUS_UPDATE: &str = "NodeStatusUpdate";

macro_rules! job {
    ($ctx:expr, $name:expr, $interval:expr, $handler:path) => {{
        let ctx = $ctx.clone();
        Job::new($name, $interval, move || {
            let ctx = ctx.clone();
            async move { $handler(&ctx).await.map(|_| ()) }
        })
    }};
}

/// Every job the node runs.
pub fn all(ctx: &NodeContext) -> Vec<Job> {
    let iv = ctx.config.intervals;
    vec![
        job!(ctx, BEST_RPC_ADDRESS, iv.best_rpc_endpoint, node::select_rpc_endpoint),
        job!(ctx, GEOIP_LOCATION, iv.geoip_location, node::refresh_location),
        job!(ctx, SESSION_USAGE_SYNC_WITH_BLOCKCHAIN, iv.session_usage_sync_with_blockchain, session::sync_usage_with_blockchain),
        job!(ctx, SESSION_USAGE_SYNC_WITH_DATABASE, iv.session_usage_sync_with_database, session::sync_usage_with_database),
        job!(ctx, SESSION_USAGE_VALIDATE, iv.session_usage_validate, session::validate_usage),
        job!(ctx, SESSION_VALIDATE, iv.session_validate, session::validate_sessions),
        job!(ctx, SPEEDTEST, iv.speedtest, node::refresh_speedtest),
        job!(ctx, NODE_STATUS_UPDATE, iv.status_update, node::update_status),
    ]
}
