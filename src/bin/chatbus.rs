//! Chatbus node - joins the cluster and chats on `general` from the terminal

use anyhow::{Context, Result};
use chatbus::bus::GENERAL_CHANNEL;
use chatbus::config::{init_tracing, NodeConfig};
use chatbus::Channel;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::info;

#[derive(Parser)]
#[command(name = "chatbus")]
#[command(about = "Join the chat cluster and talk on the general channel")]
#[command(version)]
struct Args {
    /// Handle to send messages as
    handle: String,

    #[command(flatten)]
    node: NodeConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(&args.node.log_level);

    // Identity problems are reported before touching the network
    let identity = args
        .node
        .identity(&args.handle)
        .context("Invalid client configuration")?;

    let bus = args.node.join().await.context("Failed to join cluster")?;
    let client = args.node.client(bus, identity);
    let general = Channel::parse(GENERAL_CHANNEL)?;

    let _subscription = client.subscribe_default(&general);
    info!(handle = %client.handle(), "Chat ready, type messages and press enter");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => client.publish(&general, line),
                    None => break,
                }
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, leaving chat");
                break;
            }
        }
    }

    Ok(())
}
