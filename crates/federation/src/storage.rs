//! Local Replica Storage Module
//!
//! This module implements [`LocalGraph`], a local replica of the shared
//! graph persisted with sled. It applies local writes, merges writes
//! gossiped in from peers, feeds subscriptions, and tracks the links to
//! connected peers.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::gossip::{Dialer, GossipMessage, GraphEntry, Link};
use crate::store::{split_path, GraphError, GraphStore, PeerEvent, Subscription};

/// Capacity of the update fan-out feeding subscriptions
const UPDATE_BUFFER: usize = 1024;
/// Capacity of the peer event channel
const PEER_EVENT_BUFFER: usize = 64;
/// Separator between collection and key in sled keys
const KEY_SEPARATOR: u8 = 0;

/// Local replica of the shared graph
#[derive(Clone)]
pub struct LocalGraph {
    inner: Arc<GraphInner>,
}

/// Non-owning handle to a [`LocalGraph`]
#[derive(Clone)]
pub struct WeakGraph {
    inner: Weak<GraphInner>,
}

impl WeakGraph {
    pub fn upgrade(&self) -> Option<LocalGraph> {
        self.inner.upgrade().map(|inner| LocalGraph { inner })
    }
}

struct GraphInner {
    /// Endpoint peers can reach this replica at
    endpoint: Option<String>,
    /// Main database
    db: Db,
    /// Entries tree (collection \0 key -> GraphEntry)
    entries: Tree,
    /// Highest write state seen locally or from peers
    clock: AtomicU64,
    updates: broadcast::Sender<GraphEntry>,
    peer_events: broadcast::Sender<PeerEvent>,
    /// Open links keyed by peer endpoint
    links: Mutex<HashMap<String, Link>>,
    dialer: Arc<dyn Dialer>,
}

impl LocalGraph {
    /// Open or create a replica at `db_path`.
    pub fn open<P: AsRef<Path>>(
        db_path: P,
        endpoint: Option<String>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, GraphError> {
        let db = sled::open(db_path)?;
        Self::with_db(db, endpoint, dialer)
    }

    /// In-memory replica, discarded on drop.
    pub fn temporary(endpoint: Option<String>, dialer: Arc<dyn Dialer>) -> Result<Self, GraphError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, endpoint, dialer)
    }

    fn with_db(db: Db, endpoint: Option<String>, dialer: Arc<dyn Dialer>) -> Result<Self, GraphError> {
        let entries = db.open_tree("entries")?;

        let mut clock = 0;
        for result in entries.iter() {
            let (_, bytes) = result?;
            let entry: GraphEntry = serde_json::from_slice(&bytes)?;
            clock = clock.max(entry.state);
        }

        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let (peer_events, _) = broadcast::channel(PEER_EVENT_BUFFER);

        Ok(LocalGraph {
            inner: Arc::new(GraphInner {
                endpoint,
                db,
                entries,
                clock: AtomicU64::new(clock),
                updates,
                peer_events,
                links: Mutex::new(HashMap::new()),
                dialer,
            }),
        })
    }

    /// Endpoint this replica advertises, if any.
    pub fn endpoint(&self) -> Option<&str> {
        self.inner.endpoint.as_deref()
    }

    pub fn downgrade(&self) -> WeakGraph {
        WeakGraph {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Every entry held by this replica.
    pub fn entries(&self) -> Result<Vec<GraphEntry>, GraphError> {
        let mut entries = Vec::new();
        for result in self.inner.entries.iter() {
            let (_, bytes) = result?;
            entries.push(serde_json::from_slice(&bytes)?);
        }
        Ok(entries)
    }

    /// Entries under `collection`, in key order.
    pub fn children(&self, collection: &str) -> Result<Vec<GraphEntry>, GraphError> {
        let mut prefix = collection.as_bytes().to_vec();
        prefix.push(KEY_SEPARATOR);

        let mut children = Vec::new();
        for result in self.inner.entries.scan_prefix(prefix) {
            let (_, bytes) = result?;
            children.push(serde_json::from_slice(&bytes)?);
        }
        Ok(children)
    }

    fn entry_key(collection: &str, key: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(collection.len() + key.len() + 1);
        bytes.extend_from_slice(collection.as_bytes());
        bytes.push(KEY_SEPARATOR);
        bytes.extend_from_slice(key.as_bytes());
        bytes
    }

    fn load(&self, collection: &str, key: &str) -> Result<Option<GraphEntry>, GraphError> {
        match self.inner.entries.get(Self::entry_key(collection, key))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Next local write state: wall clock, but always past anything seen.
    fn next_state(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let previous = self
            .inner
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(now.max(c + 1)))
            .unwrap_or_else(|c| c);
        now.max(previous + 1)
    }

    /// Merge `entry`; returns whether it won and was stored.
    fn apply(&self, entry: &GraphEntry) -> Result<bool, GraphError> {
        if let Some(current) = self.load(&entry.collection, &entry.key)? {
            if !entry.supersedes(&current) {
                return Ok(false);
            }
        }

        let bytes = serde_json::to_vec(entry)?;
        self.inner
            .entries
            .insert(Self::entry_key(&entry.collection, &entry.key), bytes)?;
        self.inner.clock.fetch_max(entry.state, Ordering::SeqCst);

        // No receivers just means nobody is subscribed yet
        let _ = self.inner.updates.send(entry.clone());
        Ok(true)
    }

    fn write_local(&self, collection: &str, key: &str, value: Value) -> Result<(), GraphError> {
        let entry = GraphEntry {
            collection: collection.to_string(),
            key: key.to_string(),
            state: self.next_state(),
            value,
        };

        if self.apply(&entry)? {
            self.inner.db.flush()?;
            self.broadcast(None, GossipMessage::Put { entry });
        }
        Ok(())
    }

    fn links(&self) -> MutexGuard<'_, HashMap<String, Link>> {
        self.inner.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `message` to every link except `except`; dead links are dropped.
    fn broadcast(&self, except: Option<&str>, message: GossipMessage) {
        let dead: Vec<String> = self
            .links()
            .iter()
            .filter(|(endpoint, _)| Some(endpoint.as_str()) != except)
            .filter(|(_, link)| link.send(message.clone()).is_err())
            .map(|(endpoint, _)| endpoint.clone())
            .collect();

        for endpoint in dead {
            self.detach(&endpoint);
        }
    }

    /// Handle a message received from the peer at `from`.
    pub fn ingest(&self, from: &str, message: GossipMessage) {
        match message {
            GossipMessage::Sync { entries } => {
                debug!("Received sync of {} entries from {}", entries.len(), from);
                for entry in entries {
                    self.merge_remote(from, entry);
                }
            }
            GossipMessage::Put { entry } => self.merge_remote(from, entry),
            GossipMessage::Bye => self.detach(from),
            GossipMessage::Hello { .. } => {}
        }
    }

    fn merge_remote(&self, from: &str, entry: GraphEntry) {
        match self.apply(&entry) {
            Ok(true) => self.broadcast(Some(from), GossipMessage::Put { entry }),
            Ok(false) => {}
            Err(e) => warn!("Failed to merge entry from {}: {}", from, e),
        }
    }

    /// Register a link to `endpoint` and send it our full state.
    /// Returns true when the peer was not linked before.
    pub fn attach(&self, endpoint: &str, link: Link) -> bool {
        match self.entries() {
            Ok(entries) => {
                let _ = link.send(GossipMessage::Sync { entries });
            }
            Err(e) => warn!("Failed to read state for sync with {}: {}", endpoint, e),
        }

        let is_new = self.links().insert(endpoint.to_string(), link).is_none();
        if is_new {
            debug!("Linked to peer: {}", endpoint);
            let _ = self.inner.peer_events.send(PeerEvent::Connected {
                endpoint: endpoint.to_string(),
            });
        }
        is_new
    }

    /// Forget the link to `endpoint`.
    pub fn detach(&self, endpoint: &str) {
        if self.links().remove(endpoint).is_some() {
            debug!("Unlinked from peer: {}", endpoint);
            let _ = self.inner.peer_events.send(PeerEvent::Disconnected {
                endpoint: endpoint.to_string(),
            });
        }
    }

    /// Close every link, telling peers first.
    pub fn disconnect_all(&self) {
        let endpoints: Vec<String> = self.links().keys().cloned().collect();
        for endpoint in endpoints {
            if let Some(link) = self.links().get(&endpoint) {
                let _ = link.send(GossipMessage::Bye);
            }
            self.detach(&endpoint);
        }
    }

    fn is_linked(&self, endpoint: &str) -> bool {
        self.links().contains_key(endpoint)
    }

    fn generate_key() -> String {
        format!(
            "{:x}{}",
            Utc::now().timestamp_millis(),
            hex::encode(rand::random::<[u8; 6]>())
        )
    }
}

#[async_trait]
impl GraphStore for LocalGraph {
    async fn put(&self, path: &str, value: Value) -> Result<(), GraphError> {
        let (collection, key) = split_path(path)?;
        self.write_local(collection, key, value)
    }

    async fn set(&self, collection: &str, value: Value) -> Result<String, GraphError> {
        if collection.is_empty() {
            return Err(GraphError::InvalidPath {
                path: collection.to_string(),
            });
        }
        let key = Self::generate_key();
        self.write_local(collection, &key, value)?;
        Ok(key)
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, GraphError> {
        let (collection, key) = split_path(path)?;
        Ok(self.load(collection, key)?.map(|entry| entry.value))
    }

    fn subscribe(&self, collection: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        // Subscribe before the snapshot so nothing written in between is lost
        let mut updates = self.inner.updates.subscribe();
        match self.children(collection) {
            Ok(existing) => {
                for entry in existing {
                    let _ = tx.send((entry.value, entry.key));
                }
            }
            Err(e) => warn!("Failed to read existing children of {}: {}", collection, e),
        }

        let collection = collection.to_string();
        let task = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(entry) if entry.collection == collection => {
                        if tx.send((entry.value, entry.key)).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Subscription to {} lagged, {} updates missed", collection, missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Subscription::new(rx, Some(task))
    }

    fn live_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.links().keys().cloned().collect();
        peers.sort();
        peers
    }

    async fn connect(&self, endpoints: &[String]) -> usize {
        let mut connected = 0;

        for endpoint in endpoints {
            if Some(endpoint.as_str()) == self.endpoint() || self.is_linked(endpoint) {
                continue;
            }

            match self.inner.dialer.dial(endpoint, self).await {
                Ok(link) => {
                    if self.attach(endpoint, link) {
                        connected += 1;
                    }
                }
                Err(e) => debug!("Connection attempt to {} failed: {}", endpoint, e),
            }
        }

        connected
    }

    fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.peer_events.subscribe()
    }
}
