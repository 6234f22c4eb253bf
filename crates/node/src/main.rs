//! dvpn-node: node daemon entry point
//!
//! ```text
//! dvpn-node config init --home ~/.dvpn-node     write a default config.toml
//! dvpn-node start       --home ~/.dvpn-node     run the node
//! ```
//!
//! `<home>/config.toml` holds the configuration, `<home>/data.db` the
//! session ledger. `RUST_LOG` overrides `log.level`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dvpn_common::config::{self, Config};
use dvpn_node::api::{build_router, ApiState};
use dvpn_node::chain::ChainClient;
use dvpn_node::chain_rpc::HttpChainTransport;
use dvpn_node::context::{NodeConfigBuilder, NodeContext, SharedState};
use dvpn_node::peer::PeerAdapter;
use dvpn_node::peer_client::HttpPeerService;
use dvpn_node::rpc_selector::HttpProber;
use dvpn_node::store::SessionStore;
use dvpn_node::telemetry::{HttpGeoIpResolver, HttpSpeedTester};
use dvpn_node::{jobs, Scheduler};

const CONFIG_FILE: &str = "config.toml";
const DATA_DIR: &str = "data.db";

#[derive(Parser)]
#[command(version, about = "dVPN node daemon")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node.
    Start {
        #[arg(long, default_value = ".dvpn-node")]
        home: PathBuf,
    },
    /// Configuration file helpers.
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default config.toml into the home directory.
    Init {
        #[arg(long, default_value = ".dvpn-node")]
        home: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}

fn config_init(home: &Path, force: bool) -> Result<()> {
    let path = home.join(CONFIG_FILE);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    config::save_to_file(&Config::default(), &path)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn build_context(cfg: &Config, home: &Path) -> Result<NodeContext> {
    let node_cfg = NodeConfigBuilder::from_config(cfg)?.build()?;
    let state = SharedState::new(node_cfg.rpc_addrs.first().cloned().unwrap_or_default());

    let transport = HttpChainTransport::new(state.clone(), node_cfg.tx.clone(), node_cfg.query_timeout)?;
    let chain = ChainClient::new(Arc::new(transport), node_cfg.chain_policies);

    let store = SessionStore::open(home.join(DATA_DIR))
        .with_context(|| format!("opening session ledger in {}", home.display()))?;

    let backend = HttpPeerService::new(&node_cfg.backend_url, node_cfg.service_type, node_cfg.query_timeout)?;

    Ok(NodeContext {
        prober: Arc::new(HttpProber::new(node_cfg.probe_timeout)?),
        geoip: Arc::new(HttpGeoIpResolver::new(&node_cfg.geoip_url, node_cfg.query_timeout)?),
        speedtest: Arc::new(HttpSpeedTester::new(&node_cfg.speedtest_url, node_cfg.query_timeout * 4)?),
        peers: PeerAdapter::new(Arc::new(backend)),
        chain: Arc::new(chain),
        config: Arc::new(node_cfg),
        state,
        store,
    })
}

async fn start(home: &Path) -> Result<()> {
    let cfg_path = home.join(CONFIG_FILE);
    let cfg = config::load_from_file(&cfg_path)
        .with_context(|| format!("loading {}", cfg_path.display()))?;
    init_tracing(&cfg.log.level);
    cfg.validate()?;

    let ctx = build_context(&cfg, home)?;

    info!("═══════════════════════════════════════════════════════════════");
    info!("                         dVPN Node                              ");
    info!("═══════════════════════════════════════════════════════════════");
    info!(moniker = %ctx.config.moniker, address = %ctx.config.node_address, service = %ctx.config.service_type, "node identity");
    info!(sessions = ctx.store.count(), rpc = %ctx.state.rpc_addr(), "node state");

    let listener = tokio::net::TcpListener::bind(&ctx.config.listen_on)
        .await
        .with_context(|| format!("binding {}", ctx.config.listen_on))?;
    info!("admin API listening on http://{}", ctx.config.listen_on);

    let mut scheduler = Scheduler::new();
    scheduler.register_jobs(jobs::all(&ctx));
    scheduler.start();

    let router = build_router(Arc::new(ApiState {
        ctx: ctx.clone(),
        started: Instant::now(),
    }));
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(e) => error!("failed to listen for Ctrl+C: {}", e),
            }
        })
        .await;

    scheduler.stop().await;
    ctx.store.flush()?;
    served?;

    info!("node stopped cleanly");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let res = match cli.cmd {
        Commands::Start { home } => start(&home).await,
        Commands::Config {
            cmd: ConfigCommands::Init { home, force },
        } => config_init(&home, force),
    };
    if let Err(e) = res {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
