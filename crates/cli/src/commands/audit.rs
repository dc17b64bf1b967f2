//! Audit command implementation

use anyhow::{Context, Result};
use clap::Args;
use fraudnet_federation::config::DEFAULT_DATA_DIR;
use fraudnet_federation::{AuditLog, NodeConfig};
use fraudnet_protocol::AuditEntry;
use std::path::PathBuf;

/// Arguments for the audit command
#[derive(Args, Debug, Clone)]
pub struct AuditArgs {
    /// Node data directory
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,
    /// Print the raw JSON array
    #[arg(long)]
    pub json: bool,
}

/// Execute the audit command
pub async fn execute_audit_command(args: AuditArgs) -> Result<()> {
    let path = NodeConfig::with_data_dir(&args.data_dir).audit_log_path();
    let entries = AuditLog::new(&path)
        .entries()
        .await
        .with_context(|| format!("Failed to read audit log {}", path.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("🧾 {} verified alerts in {}", entries.len(), path.display());
    for entry in &entries {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

fn format_entry(entry: &AuditEntry) -> String {
    format!(
        "   {}  {:<16} {:>12.2}  verified {} ({} attempts)",
        entry.id(),
        entry.record.alert_type,
        entry.record.amount,
        entry.verified_at,
        entry.verification_attempts
    )
}
