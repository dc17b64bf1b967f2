use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
use commands::{
    execute_audit_command, execute_node_command, execute_publish_command,
    execute_relay_command, AuditArgs, NodeArgs, PublishArgs, RelayArgs,
};

/// Default log filter when `RUST_LOG` is unset
const DEFAULT_LOG_FILTER: &str = "fraudnet=debug,info";

#[derive(Parser)]
#[command(name = "fraudnet")]
#[command(about = "Fraudnet - signed fraud alert propagation between peer nodes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a fraudnet node
    Node(NodeArgs),
    /// Run a relay peer
    Relay(RelayArgs),
    /// Publish a single alert and exit
    Publish(PublishArgs),
    /// Show this node's audit log
    Audit(AuditArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Node(args) => execute_node_command(args).await,
        Commands::Relay(args) => execute_relay_command(args).await,
        Commands::Publish(args) => execute_publish_command(args).await,
        Commands::Audit(args) => execute_audit_command(args).await,
    }
}
