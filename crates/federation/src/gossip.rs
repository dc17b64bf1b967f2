//! Gossip Protocol Module
//!
//! Replicas exchange [`GossipMessage`]s over links. A new link starts with a
//! full-state `Sync` in both directions, which is how writes buffered while
//! disconnected get replayed. After that every winning write is pushed as a
//! `Put` and relayed onwards. Merge is last-write-wins per entry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::storage::{LocalGraph, WeakGraph};
use crate::store::GraphError;

/// Sending half of a link to one peer.
pub type Link = mpsc::UnboundedSender<GossipMessage>;

/// A single replicated entry: `collection/key` with its write state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEntry {
    pub collection: String,
    pub key: String,
    /// Write state (milliseconds, monotonic per replica)
    pub state: u64,
    pub value: Value,
}

impl GraphEntry {
    /// Last-write-wins: the higher state wins, ties go to the greater
    /// serialized value so every replica settles on the same winner.
    pub fn supersedes(&self, current: &GraphEntry) -> bool {
        match self.state.cmp(&current.state) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.value.to_string() > current.value.to_string(),
        }
    }
}

/// Gossip protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GossipMessage {
    /// First frame on a transport connection
    Hello {
        /// Endpoint the sender can be reached at
        endpoint: String,
    },
    /// Full state of the sender
    Sync { entries: Vec<GraphEntry> },
    /// One write
    Put { entry: GraphEntry },
    /// Sender is closing the link
    Bye,
}

/// Opens links to peer endpoints.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `endpoint` on behalf of `local`, returning the outbound link.
    /// Inbound traffic must be fed to `local.ingest`.
    async fn dial(&self, endpoint: &str, local: &LocalGraph) -> Result<Link, GraphError>;
}

/// Dialer for replicas with no transport; every attempt fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDialer;

#[async_trait]
impl Dialer for NoDialer {
    async fn dial(&self, endpoint: &str, _local: &LocalGraph) -> Result<Link, GraphError> {
        Err(GraphError::Unreachable {
            endpoint: endpoint.to_string(),
            reason: "no transport configured".to_string(),
        })
    }
}

/// In-process gossip network.
///
/// Replicas created through a mesh can dial each other by endpoint name.
/// Used for simulations and tests.
#[derive(Clone, Default)]
pub struct Mesh {
    nodes: Arc<Mutex<HashMap<String, WeakGraph>>>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a temporary replica reachable at `endpoint`.
    pub fn graph(&self, endpoint: &str) -> Result<LocalGraph, GraphError> {
        let graph = LocalGraph::temporary(Some(endpoint.to_string()), Arc::new(self.clone()))?;
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.to_string(), graph.downgrade());
        Ok(graph)
    }

    /// Take `endpoint` off the mesh and drop all of its links.
    pub fn unplug(&self, endpoint: &str) {
        let removed = self
            .nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);

        if let Some(graph) = removed.and_then(|weak| weak.upgrade()) {
            info!("Unplugging {} from mesh", endpoint);
            graph.disconnect_all();
        }
    }

    fn lookup(&self, endpoint: &str) -> Option<LocalGraph> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .and_then(WeakGraph::upgrade)
    }

    /// Spawn a task feeding messages into `graph` as if they came from `from`.
    fn pump(graph: LocalGraph, from: String) -> Link {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                graph.ingest(&from, message);
            }
            debug!("Mesh link from {} closed", from);
        });
        tx
    }
}

#[async_trait]
impl Dialer for Mesh {
    async fn dial(&self, endpoint: &str, local: &LocalGraph) -> Result<Link, GraphError> {
        let target = self.lookup(endpoint).ok_or_else(|| GraphError::Unreachable {
            endpoint: endpoint.to_string(),
            reason: "not on mesh".to_string(),
        })?;
        let local_endpoint = local
            .endpoint()
            .ok_or_else(|| GraphError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: "local replica has no endpoint".to_string(),
            })?
            .to_string();

        let to_target = Self::pump(target.clone(), local_endpoint.clone());
        let to_local = Self::pump(local.clone(), endpoint.to_string());
        target.attach(&local_endpoint, to_local);

        Ok(to_target)
    }
}
