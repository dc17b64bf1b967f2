//! Node command implementation
//!
//! This module implements the `fraudnet node` command: it bootstraps the
//! node identity, joins the gossip network and verifies incoming alerts
//! until shutdown.

use anyhow::{Context, Result};
use clap::Args;
use fraudnet_adapters::{HttpServer, ServerConfig};
use fraudnet_federation::{FraudNode, GraphStore, NodeConfig, NodeIdentity};
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tracing::error;

use super::{parse_peer_endpoint, validate_data_dir, wait_for_shutdown, NetworkArgs};

/// Arguments for the node command
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    #[command(flatten)]
    pub network: NetworkArgs,
    /// Accept gossip links on this address
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,
    /// Serve the HTTP ingest adapter on this address
    #[arg(long)]
    pub http: Option<SocketAddr>,
    /// Extra peer endpoint to dial (repeatable)
    #[arg(short, long = "peer")]
    pub peers: Vec<String>,
}

/// Execute the node command
pub async fn execute_node_command(args: NodeArgs) -> Result<()> {
    validate_data_dir(&args.network.data_dir)?;
    let peers = args
        .peers
        .iter()
        .map(|peer| parse_peer_endpoint(peer))
        .collect::<Result<Vec<_>>>()?;

    let config = NodeConfig {
        listen_addr: args.listen,
        peers,
        ..args.network.node_config()
    };

    println!("🌐 Starting fraudnet node...");
    println!("📁 Data directory: {}", config.data_dir.display());
    if let Some(addr) = config.listen_addr {
        println!("🔌 Gossip listen: {}", addr);
    }
    println!();

    let node = FraudNode::open(config).context("Failed to create fraudnet node")?;
    let identity = node.start().await.context("Failed to start fraudnet node")?;

    println!("✅ Node started successfully!");
    print_node_status(&node, &identity).await;

    let http = args.http.map(|bind_addr| {
        let server = HttpServer::new(
            ServerConfig { bind_addr },
            node.publisher(),
            Some(node.audit()),
        );
        spawn_http(server)
    });

    println!("🔄 Node running... Press Ctrl+C to shutdown");
    wait_for_shutdown().await;

    println!("\n🛑 Shutting down node...");
    if let Some((stop, task)) = http {
        let _ = stop.send(());
        let _ = task.await;
    }
    node.shutdown().await;

    println!("✅ Node shutdown complete");
    Ok(())
}

/// Run the HTTP adapter in the background, stopped through the returned sender.
pub fn spawn_http(server: HttpServer) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stopped.await;
        };
        if let Err(e) = server.run(shutdown).await {
            error!("HTTP ingest failed: {}", e);
        }
    });
    (stop, task)
}

/// Print current node status
async fn print_node_status(node: &FraudNode, identity: &NodeIdentity) {
    println!("📈 Node Status:");
    println!("   Alias: {}", identity.alias);
    println!("   Public key: {}", identity.public_key);
    println!("   Live peers: {}", node.graph().live_peers().len());
    println!("   Dialing: {}", node.endpoints().join(", "));
    match node.audit().len().await {
        Ok(count) => println!("   Audited alerts: {}", count),
        Err(e) => println!("   Audited alerts: unavailable ({})", e),
    }
    println!();
}
