//! Relay role
//!
//! A relay is a long-lived peer with a fixed keypair on disk. Besides
//! forwarding gossip it can inject alerts of its own, signed with that key.

use async_trait::async_trait;
use fraudnet_protocol::{paths, AlertDraft, AlertRecord, KeyPair, SigningPrimitive};
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::identity::restrict_permissions;
use crate::publisher::{AlertSink, PublishError};
use crate::store::GraphStore;

/// Default relay keypair file name inside the data directory
pub const RELAY_KEYPAIR_FILE: &str = "keypair.json";

/// Alias attached to relay-signed envelopes
pub const RELAY_ALIAS: &str = "relay";

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay keypair I/O error at {path}: {source}")]
    KeyIo { path: String, source: io::Error },

    #[error("Relay keypair at {path} is invalid: {source}")]
    KeyFormat {
        path: String,
        source: serde_json::Error,
    },
}

pub struct Relay {
    store: Arc<dyn GraphStore>,
    signer: Arc<dyn SigningPrimitive>,
    keypair: KeyPair,
}

impl Relay {
    /// Load the relay keypair from `path`, generating and saving one if absent.
    /// A generated file is readable by its owner only.
    pub async fn load_or_generate(
        path: &Path,
        store: Arc<dyn GraphStore>,
        signer: Arc<dyn SigningPrimitive>,
    ) -> Result<Self, RelayError> {
        let key_io = |source| RelayError::KeyIo {
            path: path.display().to_string(),
            source,
        };
        let key_format = |source| RelayError::KeyFormat {
            path: path.display().to_string(),
            source,
        };

        let keypair = match fs::read_to_string(path).await {
            Ok(contents) => {
                let keypair: KeyPair = serde_json::from_str(&contents).map_err(key_format)?;
                info!("Loaded relay keypair from {}", path.display());
                keypair
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let keypair = signer.generate_keypair();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await.map_err(key_io)?;
                }
                let json = serde_json::to_string_pretty(&keypair).map_err(key_format)?;
                fs::write(path, json).await.map_err(key_io)?;
                restrict_permissions(path).await.map_err(key_io)?;
                info!("Generated relay keypair at {}", path.display());
                keypair
            }
            Err(e) => return Err(key_io(e)),
        };

        Ok(Self {
            store,
            signer,
            keypair,
        })
    }

    pub fn public_key(&self) -> &str {
        &self.keypair.public_key
    }

    /// Sign `draft` with the relay key and append it to the alert collection.
    pub async fn broadcast_alert(&self, draft: AlertDraft) -> Result<String, PublishError> {
        draft
            .validate()
            .map_err(|source| PublishError::Invalid { source })?;
        let record = AlertRecord::from_draft(draft);
        let value = self
            .signer
            .sign(&record.to_value()?, &self.keypair)?
            .with_alias(RELAY_ALIAS)
            .to_value()?;

        self.store
            .set(paths::ALERT_COLLECTION, value)
            .await
            .map_err(|e| PublishError::Store {
                reason: e.to_string(),
            })?;

        info!("Relay broadcast alert {}", record.id);
        Ok(record.id)
    }
}

#[async_trait]
impl AlertSink for Relay {
    async fn submit(&self, draft: AlertDraft) -> Result<String, PublishError> {
        self.broadcast_alert(draft).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::NoDialer;
    use crate::storage::LocalGraph;
    use fraudnet_protocol::{Ed25519Signer, SignedEnvelope};
    use tempfile::TempDir;

    async fn relay(path: &Path, graph: &LocalGraph) -> Relay {
        Relay::load_or_generate(path, Arc::new(graph.clone()), Arc::new(Ed25519Signer))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_keypair_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RELAY_KEYPAIR_FILE);
        let graph = LocalGraph::temporary(None, Arc::new(NoDialer)).unwrap();

        let first = relay(&path, &graph).await;
        assert!(path.exists());
        let second = relay(&path, &graph).await;
        assert_eq!(first.public_key(), second.public_key());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_generated_keypair_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RELAY_KEYPAIR_FILE);
        let graph = LocalGraph::temporary(None, Arc::new(NoDialer)).unwrap();
        relay(&path, &graph).await;

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_invalid_keypair_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RELAY_KEYPAIR_FILE);
        std::fs::write(&path, "nope").unwrap();
        let graph = LocalGraph::temporary(None, Arc::new(NoDialer)).unwrap();

        let result =
            Relay::load_or_generate(&path, Arc::new(graph), Arc::new(Ed25519Signer)).await;
        assert!(matches!(result, Err(RelayError::KeyFormat { .. })));
    }

    #[tokio::test]
    async fn test_broadcast_signs_with_relay_key() {
        let dir = TempDir::new().unwrap();
        let graph = LocalGraph::temporary(None, Arc::new(NoDialer)).unwrap();
        let relay = relay(&dir.path().join(RELAY_KEYPAIR_FILE), &graph).await;

        let id = relay
            .submit(AlertDraft::new(5000.0, "relay-test").with_id("fraud-relay"))
            .await
            .unwrap();
        assert_eq!(id, "fraud-relay");

        let children = graph.children(paths::ALERT_COLLECTION).unwrap();
        assert_eq!(children.len(), 1);
        let envelope = SignedEnvelope::from_value(children[0].value.clone()).unwrap();
        assert_eq!(envelope.signer_public_key, relay.public_key());
        assert_eq!(envelope.signer_alias.as_deref(), Some(RELAY_ALIAS));
        assert!(Ed25519Signer
            .verify(&envelope, relay.public_key())
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_broadcast_rejects_nested_id() {
        let dir = TempDir::new().unwrap();
        let graph = LocalGraph::temporary(None, Arc::new(NoDialer)).unwrap();
        let relay = relay(&dir.path().join(RELAY_KEYPAIR_FILE), &graph).await;

        let result = relay
            .broadcast_alert(AlertDraft::new(1.0, "fraud").with_id("fraud/relay"))
            .await;
        assert!(matches!(result, Err(PublishError::Invalid { .. })));
        assert!(graph.children(paths::ALERT_COLLECTION).unwrap().is_empty());
    }
}
