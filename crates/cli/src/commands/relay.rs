//! Relay command implementation
//!
//! `fraudnet relay` keeps a graph replica online for nodes to gossip
//! through, and optionally accepts alerts over HTTP which it signs with
//! its own keypair.

use anyhow::{Context, Result};
use clap::Args;
use fraudnet_adapters::{HttpServer, ServerConfig};
use fraudnet_federation::transport::endpoint_url;
use fraudnet_federation::{serve, LocalGraph, Relay, TcpDialer};
use fraudnet_protocol::Ed25519Signer;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::error;

use super::node::spawn_http;
use super::{validate_data_dir, wait_for_shutdown, NetworkArgs};

/// Arguments for the relay command
#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    #[command(flatten)]
    pub network: NetworkArgs,
    /// Interface to accept gossip links on; the port is the relay port
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,
    /// Serve the HTTP ingest adapter on this address
    #[arg(long)]
    pub http: Option<SocketAddr>,
}

/// Execute the relay command
pub async fn execute_relay_command(args: RelayArgs) -> Result<()> {
    validate_data_dir(&args.network.data_dir)?;
    let listen_addr = SocketAddr::new(args.bind, args.network.relay_port);
    let config = fraudnet_federation::NodeConfig {
        listen_addr: Some(listen_addr),
        ..args.network.node_config()
    };

    println!("📡 Starting fraudnet relay...");
    println!("📁 Data directory: {}", config.data_dir.display());

    let advertised = config
        .advertised_endpoint()
        .unwrap_or_else(|| endpoint_url(&args.bind.to_string(), args.network.relay_port));
    let graph = LocalGraph::open(
        config.graph_path(),
        Some(advertised.clone()),
        Arc::new(TcpDialer::default()),
    )
    .with_context(|| format!("Failed to open graph at {}", config.graph_path().display()))?;

    let relay = Arc::new(
        Relay::load_or_generate(
            &config.relay_keypair_path(),
            Arc::new(graph.clone()),
            Arc::new(Ed25519Signer),
        )
        .await
        .context("Failed to load relay keypair")?,
    );

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind relay on {}", listen_addr))?;
    let gossip = tokio::spawn(serve(graph.clone(), listener));

    println!("🔑 Relay public key: {}", relay.public_key());
    println!("🔌 Gossip endpoint: {}", advertised);

    let http = args.http.map(|bind_addr| {
        spawn_http(HttpServer::new(ServerConfig { bind_addr }, relay.clone(), None))
    });

    println!("🔄 Relay running... Press Ctrl+C to shutdown");
    tokio::select! {
        _ = wait_for_shutdown() => {}
        result = gossip => {
            match result {
                Ok(Err(e)) => error!("Gossip listener stopped: {}", e),
                Ok(Ok(())) => {}
                Err(e) => error!("Gossip listener task failed: {}", e),
            }
        }
    }

    println!("\n🛑 Shutting down relay...");
    if let Some((stop, task)) = http {
        let _ = stop.send(());
        let _ = task.await;
    }
    graph.disconnect_all();

    println!("✅ Relay shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: RelayArgs,
    }

    #[test]
    fn test_relay_args() {
        let harness =
            Harness::try_parse_from(["relay", "--relay-port", "4000", "--bind", "127.0.0.1"])
                .unwrap();
        assert_eq!(harness.args.network.relay_port, 4000);
        assert_eq!(harness.args.bind, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(harness.args.http.is_none());
    }
}
