//! Alert Publisher Module
//!
//! Completes, signs and writes alerts into the graph. The keyed write under
//! `fraud-alerts/<id>` decides success; the collection append and the
//! latest-alert pointer are best effort.

use async_trait::async_trait;
use fraudnet_protocol::{paths, AlertDraft, AlertRecord, ProtocolError, SigningPrimitive};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::identity::IdentityManager;
use crate::monitor::PeerSet;
use crate::store::GraphStore;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Node identity is not authenticated")]
    NotAuthenticated,

    #[error("Invalid alert: {source}")]
    Invalid { source: ProtocolError },

    #[error("Failed to sign alert: {source}")]
    Signing { source: ProtocolError },

    #[error("Store rejected alert: {reason}")]
    Store { reason: String },
}

impl From<ProtocolError> for PublishError {
    fn from(source: ProtocolError) -> Self {
        PublishError::Signing { source }
    }
}

/// Anything that accepts alerts from an ingest surface
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Publish `draft`, returning the alert id.
    async fn submit(&self, draft: AlertDraft) -> Result<String, PublishError>;
}

/// Publisher timings
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Wait after a reconnect attempt when no peer is connected
    pub reconnect_wait: Duration,
    /// Delay before reading back a keyed write
    pub read_back_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            reconnect_wait: Duration::from_secs(1),
            read_back_delay: Duration::from_millis(500),
        }
    }
}

pub struct Publisher {
    store: Arc<dyn GraphStore>,
    signer: Arc<dyn SigningPrimitive>,
    identity: Arc<IdentityManager>,
    peers: PeerSet,
    endpoints: Vec<String>,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn GraphStore>,
        signer: Arc<dyn SigningPrimitive>,
        identity: Arc<IdentityManager>,
        peers: PeerSet,
        endpoints: Vec<String>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            signer,
            identity,
            peers,
            endpoints,
            config,
        }
    }

    /// Sign and publish an alert, returning its id.
    ///
    /// Publishing the same id twice overwrites the keyed envelope; receivers
    /// deduplicate by id.
    pub async fn publish(&self, draft: AlertDraft) -> Result<String, PublishError> {
        draft
            .validate()
            .map_err(|source| PublishError::Invalid { source })?;
        let identity = self
            .identity
            .current()
            .await
            .ok_or(PublishError::NotAuthenticated)?;
        let record = AlertRecord::from_draft(draft);

        if self.peers.is_empty().await {
            warn!("No peers connected, reconnecting before publishing {}", record.id);
            let linked = self.store.connect(&self.endpoints).await;
            debug!("Reconnect linked {} peers", linked);
            sleep(self.config.reconnect_wait).await;
        }

        let envelope = self
            .signer
            .sign(&record.to_value()?, identity.keypair())?
            .with_alias(identity.alias.clone());
        let value = envelope.to_value()?;

        let keyed = paths::alert(&record.id);
        self.store
            .put(&keyed, value.clone())
            .await
            .map_err(|e| PublishError::Store {
                reason: e.to_string(),
            })?;
        self.schedule_read_back(keyed, value.clone());

        if let Err(e) = self.store.set(paths::ALERT_COLLECTION, value).await {
            warn!("Failed to append alert {} to {}: {}", record.id, paths::ALERT_COLLECTION, e);
        }

        match serde_json::to_value(record.latest_pointer(&identity.alias)) {
            Ok(pointer) => {
                if let Err(e) = self.store.put(paths::LATEST_ALERT, pointer).await {
                    warn!("Failed to update latest alert pointer: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode latest alert pointer: {}", e),
        }

        info!(
            "Published alert {} ({} {}) as {}",
            record.id, record.alert_type, record.amount, identity.alias
        );
        Ok(record.id)
    }

    fn schedule_read_back(&self, path: String, expected: Value) {
        let store = self.store.clone();
        let delay = self.config.read_back_delay;

        tokio::spawn(async move {
            sleep(delay).await;
            match store.get(&path).await {
                Ok(Some(stored)) if stored == expected => debug!("Read back {} ok", path),
                Ok(Some(_)) => warn!("Read back of {} does not match what was written", path),
                Ok(None) => warn!("Read back of {} found nothing", path),
                Err(e) => warn!("Read back of {} failed: {}", path, e),
            }
        });
    }
}

#[async_trait]
impl AlertSink for Publisher {
    async fn submit(&self, draft: AlertDraft) -> Result<String, PublishError> {
        self.publish(draft).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, AUDIT_LOG_FILE};
    use crate::gossip::NoDialer;
    use crate::identity::{IdentityConfig, CREDENTIALS_FILE};
    use crate::retry::RetryPolicy;
    use crate::storage::LocalGraph;
    use crate::verifier::{Verifier, VerifierConfig};
    use fraudnet_protocol::{Ed25519Signer, LatestPointer, SignedEnvelope};
    use tempfile::TempDir;

    fn quick_config() -> PublisherConfig {
        PublisherConfig {
            reconnect_wait: Duration::from_millis(10),
            read_back_delay: Duration::from_millis(10),
        }
    }

    fn publisher(graph: &LocalGraph, dir: &TempDir) -> (Publisher, Arc<IdentityManager>) {
        let store: Arc<dyn GraphStore> = Arc::new(graph.clone());
        let signer: Arc<dyn SigningPrimitive> = Arc::new(Ed25519Signer);
        let identity = Arc::new(IdentityManager::new(
            store.clone(),
            signer.clone(),
            dir.path().join(CREDENTIALS_FILE),
            IdentityConfig::default(),
        ));
        let publisher = Publisher::new(
            store,
            signer,
            identity.clone(),
            PeerSet::new(),
            vec!["tcp://127.0.0.1:1".to_string()],
            quick_config(),
        );
        (publisher, identity)
    }

    #[tokio::test]
    async fn test_requires_authentication() {
        let dir = TempDir::new().unwrap();
        let graph = LocalGraph::temporary(None, Arc::new(NoDialer)).unwrap();
        let (publisher, _) = publisher(&graph, &dir);

        let result = publisher.publish(AlertDraft::new(100.0, "fraud")).await;
        assert!(matches!(result, Err(PublishError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn test_publish_without_peers_writes_all_paths() {
        let dir = TempDir::new().unwrap();
        let graph = LocalGraph::temporary(None, Arc::new(NoDialer)).unwrap();
        let (publisher, identities) = publisher(&graph, &dir);
        let identity = identities.init_identity().await.unwrap();

        let id = publisher
            .publish(AlertDraft::new(742.5, "velocity").with_field("nodeId", "node-alpha"))
            .await
            .unwrap();
        assert!(id.starts_with("fraud-"));

        let keyed = graph.get(&paths::alert(&id)).await.unwrap().unwrap();
        let envelope = SignedEnvelope::from_value(keyed).unwrap();
        assert_eq!(envelope.signer_public_key, identity.public_key);
        assert_eq!(envelope.signer_alias.as_deref(), Some(identity.alias.as_str()));

        let payload = Ed25519Signer
            .verify(&envelope, &identity.public_key)
            .unwrap()
            .unwrap();
        let record = AlertRecord::from_value(payload).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.fields["nodeId"], "node-alpha");

        assert_eq!(graph.children(paths::ALERT_COLLECTION).unwrap().len(), 1);

        let pointer: LatestPointer =
            serde_json::from_value(graph.get(paths::LATEST_ALERT).await.unwrap().unwrap()).unwrap();
        assert_eq!(pointer.id, id);
        assert_eq!(pointer.publisher, identity.alias);
    }

    #[tokio::test]
    async fn test_republish_same_id_keeps_latest_payload() {
        let dir = TempDir::new().unwrap();
        let graph = LocalGraph::temporary(None, Arc::new(NoDialer)).unwrap();
        let (publisher, identities) = publisher(&graph, &dir);
        let identity = identities.init_identity().await.unwrap();

        let audit = Arc::new(AuditLog::new(dir.path().join(AUDIT_LOG_FILE)));
        let verifier = Arc::new(Verifier::new(
            Arc::new(graph.clone()),
            Arc::new(Ed25519Signer),
            audit.clone(),
            VerifierConfig {
                settle_delay: Duration::from_millis(1),
                policy: RetryPolicy::fixed(5, Duration::from_millis(1)),
                max_in_flight: 8,
            },
        ));
        let task = verifier.spawn();

        let first = AlertDraft::new(10.0, "fraud").with_id("fraud-1");
        let second = AlertDraft::new(20.0, "fraud").with_id("fraud-1");
        assert_eq!(publisher.publish(first).await.unwrap(), "fraud-1");
        assert_eq!(publisher.submit(second).await.unwrap(), "fraud-1");

        let keyed: Vec<_> = graph
            .children(paths::ALERTS_BY_ID)
            .unwrap()
            .into_iter()
            .filter(|entry| entry.key == "fraud-1")
            .collect();
        assert_eq!(keyed.len(), 1);

        let envelope = SignedEnvelope::from_value(keyed[0].value.clone()).unwrap();
        let payload = Ed25519Signer
            .verify(&envelope, &identity.public_key)
            .unwrap()
            .unwrap();
        assert_eq!(AlertRecord::from_value(payload).unwrap().amount, 20.0);

        let mut settled = false;
        for _ in 0..400 {
            let entries = audit.entries().await.unwrap();
            if entries.len() == 1 && entries[0].record.amount == 20.0 {
                settled = true;
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        task.abort();
        assert!(settled);
        assert_eq!(audit.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_unroutable_drafts() {
        let dir = TempDir::new().unwrap();
        let graph = LocalGraph::temporary(None, Arc::new(NoDialer)).unwrap();
        let (publisher, identities) = publisher(&graph, &dir);
        identities.init_identity().await.unwrap();

        let nested = AlertDraft::new(10.0, "fraud").with_id("fraud/1");
        assert!(matches!(
            publisher.publish(nested).await,
            Err(PublishError::Invalid { .. })
        ));
        let unbounded = AlertDraft::new(f64::INFINITY, "fraud");
        assert!(matches!(
            publisher.publish(unbounded).await,
            Err(PublishError::Invalid { .. })
        ));
        assert!(graph.children(paths::ALERT_COLLECTION).unwrap().is_empty());
    }
}
