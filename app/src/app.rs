use crate::context::NodeContext;
use crate::metrics;
use crate::peers::{Peer, PeerState};
use crate::spec::{genesis_value_parser, ChainSpec};
use clap::builder::ArgPredicate;
use clap::Parser;
use eyre::Result;
use futures::pin_mut;
use std::str::FromStr;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

/// Seed peers given on the command line count as connected.
fn parse_peer(s: &str) -> Result<Peer, eyre::Error> {
    let mut peer = Peer::parse(s)?;
    peer.state = PeerState::Connected;
    Ok(peer)
}

#[derive(Parser)]
#[command(author, about = "DPoS node", long_about = None)]
pub struct App {
    #[arg(
        long = "chain",
        value_name = "CHAIN_OR_PATH",
        value_parser = genesis_value_parser,
        default_value_if("dev", ArgPredicate::IsPresent, Some("dev")),
        required_unless_present = "dev"
    )]
    chain_spec: Option<ChainSpec>,

    /// Run on the development chain
    #[arg(long)]
    pub dev: bool,

    /// Port advertised to peers
    #[arg(long, default_value_t = 5555)]
    pub port: u16,

    #[arg(long, env = "NODE_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub version: String,

    /// Seed peer as ip:port, repeatable
    #[arg(long = "peer", value_parser = parse_peer)]
    pub peers: Vec<Peer>,

    #[arg(long = "request-timeout-ms", default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// Load the stored chain without scheduling periodic sync
    #[arg(long = "no-sync", default_value_t = false)]
    pub no_sync: bool,

    /// Log every crate, not only this node
    #[arg(long = "full-log-context", env = "FULL_LOG_CONTEXT", default_value_t = false)]
    pub full_log_context: bool,

    #[clap(long, help = "Port for the metrics server")]
    pub metrics_port: Option<u16>,
}

impl App {
    pub fn run(self) -> Result<()> {
        init_tracing(self.full_log_context);
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(self.execute())
    }

    async fn execute(self) -> Result<()> {
        let spec = self
            .chain_spec
            .ok_or_else(|| eyre::eyre!("either --chain or --dev is required"))?;
        metrics::start_server(self.metrics_port).await;

        let node = NodeContext::builder(spec)
            .version(&self.version)
            .port(self.port)
            .request_timeout(Duration::from_millis(self.request_timeout_ms))
            .build();
        info!(nethash = %node.system.headers().nethash, nonce = %node.system.nonce(), "Starting node");

        {
            let mut directory = node.peers.write().await;
            for peer in self.peers {
                directory.upsert(peer, false);
            }
        }
        let expiry = node.spawn_pool_expiry();

        node.loader.load_block_chain().await?;
        if self.no_sync {
            info!("Periodic sync disabled");
        } else {
            node.loader.on_peers_ready()?;
        }
        let height = node.chain.height().await;
        info!(height, "Node running");

        wait_for_shutdown().await?;
        node.loader.cleanup();
        expiry.abort();
        let height = node.chain.height().await;
        info!(height, "Node stopped");
        Ok(())
    }
}

/// `RUST_LOG` picks the level only; targets outside this crate stay quiet
/// unless `full_context` is set.
fn init_tracing(full_context: bool) {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|raw| Level::from_str(&raw).ok())
        .unwrap_or(Level::INFO);
    let directive = if full_context {
        level.to_string()
    } else {
        format!("dpos_node={level}")
    };
    let filter = EnvFilter::builder().parse_lossy(directive);

    let verbose = level >= Level::DEBUG;
    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(verbose)
        .with_line_number(verbose)
        .with_filter(filter);
    tracing_subscriber::registry().with(layer).init();
}

async fn wait_for_shutdown() -> Result<(), std::io::Error> {
    let mut terminate = signal(SignalKind::terminate())?;
    let ctrl_c = tokio::signal::ctrl_c();
    let sigterm = terminate.recv();
    pin_mut!(ctrl_c, sigterm);

    tokio::select! {
        res = ctrl_c => {
            res?;
            info!("Received ctrl-c");
        },
        _ = sigterm => info!("Received SIGTERM"),
    }
    Ok(())
}
