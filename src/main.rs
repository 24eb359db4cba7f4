mod cli;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use cli::Cli;
use social_p2p::network::{MessageKind, Node};
use social_p2p::utils::setup_logging;
use social_p2p::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_init(&cli.config)?;
    config.apply_env();
    if let Some(port) = cli.port {
        config.p2p_port = port;
    }
    if cli.no_upnp {
        config.enable_upnp = false;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    setup_logging(config.log_level())?;
    info!("Starting P2P node...");

    let node = Arc::new(Node::new(config.network_config()));

    // Answer pings so peers can check that we are alive
    let weak = Arc::downgrade(&node);
    node.add_message_handler(MessageKind::Ping, move |peer_id: &str, data: Value| {
        info!("Ping from {}", peer_id);
        if let Some(node) = weak.upgrade() {
            let peer_id = peer_id.to_string();
            tokio::spawn(async move {
                node.send(&peer_id, MessageKind::Pong, data).await;
            });
        }
    })
    .await;
    node.add_message_handler(MessageKind::Pong, |peer_id: &str, _data: Value| {
        info!("Pong from {}", peer_id);
    })
    .await;

    node.start().await?;

    for peer in &cli.peers {
        if !node.connect_to_peer(&peer.host, peer.port, peer.peer_id.clone()).await {
            warn!("Could not reach {}:{}", peer.host, peer.port);
        }
    }
    node.broadcast(MessageKind::Ping, Value::Object(Default::default())).await;

    info!("P2P network ready! Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    node.stop().await;
    Ok(())
}
