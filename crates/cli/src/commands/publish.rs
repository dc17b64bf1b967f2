//! Publish command implementation
//!
//! `fraudnet publish` brings a node up just long enough to sign one alert,
//! hand it to its peers and exit.

use anyhow::{Context, Result};
use clap::Args;
use fraudnet_federation::FraudNode;
use fraudnet_protocol::AlertDraft;
use serde_json::Value;
use std::time::Duration;

use super::{parse_peer_endpoint, validate_data_dir, NetworkArgs};

/// Arguments for the publish command
#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    #[command(flatten)]
    pub network: NetworkArgs,
    /// Transaction amount
    #[arg(long)]
    pub amount: f64,
    /// Alert type
    #[arg(long = "type", default_value = fraudnet_protocol::DEFAULT_ALERT_TYPE)]
    pub alert_type: String,
    /// Alert id; generated when omitted
    #[arg(long)]
    pub id: Option<String>,
    /// Extra field as key=value; JSON values are parsed (repeatable)
    #[arg(long = "field")]
    pub fields: Vec<String>,
    /// Extra peer endpoint to dial (repeatable)
    #[arg(short, long = "peer")]
    pub peers: Vec<String>,
    /// How long to stay online after publishing so peers can sync
    #[arg(long, default_value_t = 2000)]
    pub linger_ms: u64,
}

impl PublishArgs {
    pub fn draft(&self) -> Result<AlertDraft> {
        let mut draft = AlertDraft::new(self.amount, self.alert_type.clone());
        if let Some(id) = &self.id {
            draft = draft.with_id(id.clone());
        }
        for field in &self.fields {
            let (key, value) = parse_field(field)?;
            draft = draft.with_field(key, value);
        }
        Ok(draft)
    }
}

/// Split `key=value`, reading the value as JSON when it parses.
pub fn parse_field(field: &str) -> Result<(String, Value)> {
    let (key, raw) = field
        .split_once('=')
        .with_context(|| format!("Invalid field '{}'. Expected format: key=value", field))?;
    if key.is_empty() {
        anyhow::bail!("Invalid field '{}': empty key", field);
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Execute the publish command
pub async fn execute_publish_command(args: PublishArgs) -> Result<()> {
    let draft = args.draft()?;
    validate_data_dir(&args.network.data_dir)?;
    let peers = args
        .peers
        .iter()
        .map(|peer| parse_peer_endpoint(peer))
        .collect::<Result<Vec<_>>>()?;

    let config = fraudnet_federation::NodeConfig {
        peers,
        ..args.network.node_config()
    };

    let node = FraudNode::open(config).context("Failed to create fraudnet node")?;
    let identity = node.start().await.context("Failed to start fraudnet node")?;

    let published = node.publish(draft).await;
    tokio::time::sleep(Duration::from_millis(args.linger_ms)).await;
    node.shutdown().await;

    let id = published.context("Failed to publish alert")?;
    println!("📣 Published alert {} as {}", id, identity.alias);
    Ok(())
}
