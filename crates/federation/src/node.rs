//! Node Management Module
//!
//! A `FraudNode` owns one graph replica and the components built on it:
//! identity, publisher, verifier, audit log and peer monitor. One per
//! process.

use anyhow::{Context, Result};
use fraudnet_protocol::{AlertDraft, Ed25519Signer, SigningPrimitive};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::audit::AuditLog;
use crate::config::NodeConfig;
use crate::identity::{IdentityManager, NodeIdentity};
use crate::monitor::{PeerMonitor, PeerSet};
use crate::publisher::{PublishError, Publisher};
use crate::storage::LocalGraph;
use crate::store::GraphStore;
use crate::transport::{serve, TcpDialer};
use crate::verifier::Verifier;

/// A fraudnet node
pub struct FraudNode {
    config: NodeConfig,
    graph: LocalGraph,
    endpoints: Vec<String>,
    identity: Arc<IdentityManager>,
    publisher: Arc<Publisher>,
    verifier: Arc<Verifier>,
    monitor: Arc<PeerMonitor>,
    audit: Arc<AuditLog>,
    peers: PeerSet,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FraudNode {
    /// Open the replica under the data directory, dialing peers over TCP.
    pub fn open(config: NodeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data directory {}", config.data_dir.display())
        })?;

        let graph = LocalGraph::open(
            config.graph_path(),
            config.advertised_endpoint(),
            Arc::new(TcpDialer::default()),
        )
        .with_context(|| format!("Failed to open graph at {}", config.graph_path().display()))?;

        Ok(Self::with_graph(config, graph))
    }

    /// Build a node around an existing replica.
    pub fn with_graph(config: NodeConfig, graph: LocalGraph) -> Self {
        Self::with_signer(config, graph, Arc::new(Ed25519Signer))
    }

    pub fn with_signer(
        config: NodeConfig,
        graph: LocalGraph,
        signer: Arc<dyn SigningPrimitive>,
    ) -> Self {
        let store: Arc<dyn GraphStore> = Arc::new(graph.clone());
        let endpoints = config.peer_endpoints();
        let peers = PeerSet::new();
        let audit = Arc::new(AuditLog::new(config.audit_log_path()));

        let identity = Arc::new(IdentityManager::new(
            store.clone(),
            signer.clone(),
            config.credentials_path(),
            config.identity.clone(),
        ));
        let publisher = Arc::new(Publisher::new(
            store.clone(),
            signer.clone(),
            identity.clone(),
            peers.clone(),
            endpoints.clone(),
            config.publisher.clone(),
        ));
        let verifier = Arc::new(Verifier::new(
            store.clone(),
            signer,
            audit.clone(),
            config.verifier.clone(),
        ));
        let monitor = Arc::new(PeerMonitor::new(
            store,
            identity.clone(),
            peers.clone(),
            endpoints.clone(),
            config.monitor.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        FraudNode {
            config,
            graph,
            endpoints,
            identity,
            publisher,
            verifier,
            monitor,
            audit,
            peers,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Listen, connect, start the verifier and monitor, then bootstrap the
    /// identity.
    pub async fn start(&self) -> Result<Arc<NodeIdentity>> {
        info!("Starting fraudnet node in {}", self.config.data_dir.display());

        if let Some(addr) = self.config.listen_addr {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind gossip listener on {}", addr))?;
            let graph = self.graph.clone();
            self.track(tokio::spawn(async move {
                if let Err(e) = serve(graph, listener).await {
                    error!("Gossip listener stopped: {}", e);
                }
            }));
        }

        let linked = self.graph.connect(&self.endpoints).await;
        info!(
            "Connected to {} of {} peer endpoints",
            linked,
            self.endpoints.len()
        );

        self.track(self.verifier.clone().spawn());

        let monitor = self.monitor.clone();
        let shutdown = self.shutdown.subscribe();
        self.track(tokio::spawn(async move { monitor.run(shutdown).await }));

        let identity = self
            .identity
            .init_identity()
            .await
            .context("Identity bootstrap failed")?;
        info!("Node ready as {} ({})", identity.alias, identity.public_key);
        Ok(identity)
    }

    /// Publish through this node's publisher.
    pub async fn publish(&self, draft: AlertDraft) -> Result<String, PublishError> {
        self.publisher.publish(draft).await
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn graph(&self) -> &LocalGraph {
        &self.graph
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn identity(&self) -> Arc<IdentityManager> {
        self.identity.clone()
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Stop background tasks and say goodbye to peers.
    pub async fn shutdown(&self) {
        info!("Shutting down fraudnet node");

        let _ = self.shutdown.send(true);
        self.graph.disconnect_all();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        info!("Node shutdown complete");
    }
}
