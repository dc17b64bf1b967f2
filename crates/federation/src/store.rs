//! Replicated graph store interface.
//!
//! The propagation engine never talks to a concrete store directly. It
//! writes, reads and subscribes through [`GraphStore`], which gives
//! eventual replication with no ordering guarantee and at-least-once
//! delivery of updates.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Graph store errors
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Database error: {source}")]
    DatabaseError { source: sled::Error },

    #[error("Serialization error: {source}")]
    SerializationError { source: serde_json::Error },

    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("Peer unreachable: {endpoint} ({reason})")]
    Unreachable { endpoint: String, reason: String },

    #[error("Write rejected: {reason}")]
    Rejected { reason: String },
}

impl From<sled::Error> for GraphError {
    fn from(source: sled::Error) -> Self {
        GraphError::DatabaseError { source }
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(source: serde_json::Error) -> Self {
        GraphError::SerializationError { source }
    }
}

/// Transport-level connectivity change for a peer endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected { endpoint: String },
    Disconnected { endpoint: String },
}

/// Split `collection/key` at the last separator.
pub fn split_path(path: &str) -> Result<(&str, &str), GraphError> {
    match path.rsplit_once('/') {
        Some((collection, key)) if !collection.is_empty() && !key.is_empty() => {
            Ok((collection, key))
        }
        _ => Err(GraphError::InvalidPath {
            path: path.to_string(),
        }),
    }
}

/// Replicated key/subtree store.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Keyed write at `collection/key`; resolves once acknowledged locally.
    async fn put(&self, path: &str, value: Value) -> Result<(), GraphError>;

    /// Unkeyed append into `collection`; returns the generated key.
    async fn set(&self, collection: &str, value: Value) -> Result<String, GraphError>;

    /// One-shot read of `collection/key`.
    async fn get(&self, path: &str) -> Result<Option<Value>, GraphError>;

    /// Observe every child of `collection`, existing ones first, then each
    /// update as it lands. The same child may be yielded more than once.
    fn subscribe(&self, collection: &str) -> Subscription;

    /// Endpoints of the currently connected peers.
    fn live_peers(&self) -> Vec<String>;

    /// (Re)issue connection attempts; returns how many new links came up.
    async fn connect(&self, endpoints: &[String]) -> usize;

    /// Connect/disconnect notifications.
    fn peer_events(&self) -> broadcast::Receiver<PeerEvent>;
}

/// A cancellable stream of `(value, key)` pairs from one collection.
///
/// The sequence is lazy and never restarts. Dropping the subscription
/// cancels it.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<(Value, String)>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a receiver fed by `task`; the task is aborted on cancel.
    pub fn new(rx: mpsc::UnboundedReceiver<(Value, String)>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    /// Subscription fed directly through the returned sender.
    pub fn channel() -> (mpsc::UnboundedSender<(Value, String)>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx, None))
    }

    /// Next `(value, key)` pair, or `None` once cancelled.
    pub async fn next(&mut self) -> Option<(Value, String)> {
        self.rx.recv().await
    }

    /// Stop producing items.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
