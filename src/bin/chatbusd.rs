//! Chatbus daemon - protocol bridge, static web client and a console chat client

use anyhow::{Context, Result};
use chatbus::bridge::{run_bridge_server, BridgeConfig, ProtocolBridge};
use chatbus::bus::GENERAL_CHANNEL;
use chatbus::config::{init_tracing, NodeConfig};
use chatbus::Channel;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[derive(Parser)]
#[command(name = "chatbusd")]
#[command(about = "Chat cluster node exposing the general channel to browsers")]
#[command(version)]
struct Args {
    /// Handle for this node's own chat client
    handle: String,

    /// Address for the bridge and static assets
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "CHATBUS_BIND")]
    bind: SocketAddr,

    /// Directory served to browsers
    #[arg(long, default_value = "web", env = "CHATBUS_WEB_ROOT")]
    web_root: PathBuf,

    /// How long a bridged request waits for its reply
    #[arg(long, default_value_t = 2500, env = "CHATBUS_REPLY_TIMEOUT_MS")]
    reply_timeout_ms: u64,

    #[command(flatten)]
    node: NodeConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(&args.node.log_level);

    run_daemon(args).await
}

async fn run_daemon(args: Args) -> Result<()> {
    let identity = args
        .node
        .identity(&args.handle)
        .context("Invalid client configuration")?;

    let bus = args.node.join().await.context("Failed to join cluster")?;

    let config = BridgeConfig::configure([GENERAL_CHANNEL], args.reply_timeout_ms)?;
    let bridge = Arc::new(ProtocolBridge::new(config, bus.clone()));

    let client = args.node.client(bus, identity);
    let general = Channel::parse(GENERAL_CHANNEL)?;
    let _subscription = client.subscribe_default(&general);

    info!(addr = %args.bind, handle = %client.handle(), "Chatbus daemon starting");

    run_bridge_server(args.bind, bridge, &args.web_root, shutdown_signal())
        .await
        .with_context(|| format!("Bridge failed on {}", args.bind))?;

    info!("Chatbus daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping bridge");
}
