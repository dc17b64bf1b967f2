//! CLI command modules

pub mod audit;
pub mod node;
pub mod publish;
pub mod relay;

pub use audit::{execute_audit_command, AuditArgs};
pub use node::{execute_node_command, NodeArgs};
pub use publish::{execute_publish_command, PublishArgs};
pub use relay::{execute_relay_command, RelayArgs};

use anyhow::{Context, Result};
use clap::Args;
use fraudnet_federation::config::DEFAULT_DATA_DIR;
use fraudnet_federation::transport::parse_endpoint;
use fraudnet_federation::{NodeConfig, DEFAULT_RELAY_PORT};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::error;

/// Where state lives and how to reach the relay
#[derive(Args, Debug, Clone)]
pub struct NetworkArgs {
    /// Directory for identity, audit log and graph replica
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,
    /// Relay host to dial
    #[arg(long, env = "RELAY_HOST")]
    pub relay_host: Option<String>,
    /// Relay gossip port
    #[arg(long, env = "PORT_RELAY", default_value_t = DEFAULT_RELAY_PORT)]
    pub relay_port: u16,
    /// Override the detected local IP
    #[arg(long, env = "LOCAL_IP")]
    pub local_ip: Option<IpAddr>,
}

impl NetworkArgs {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            relay_host: self.relay_host.clone(),
            relay_port: self.relay_port,
            local_ip: self.local_ip,
            ..NodeConfig::with_data_dir(&self.data_dir)
        }
    }
}

/// Make sure the data directory exists and is writable.
pub fn validate_data_dir(data_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

    let test_file = data_dir.join(".fraudnet_write_test");
    match std::fs::write(&test_file, b"test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&test_file);
            Ok(())
        }
        Err(e) => {
            anyhow::bail!("Cannot write to data directory {}: {}", data_dir.display(), e);
        }
    }
}

/// Parse a peer endpoint with a helpful error message
pub fn parse_peer_endpoint(peer: &str) -> Result<String> {
    parse_endpoint(peer).with_context(|| {
        format!(
            "Invalid peer endpoint '{}'. Expected format: tcp://HOST:PORT (e.g., tcp://127.0.0.1:3031)",
            peer
        )
    })?;
    Ok(peer.to_string())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
