//! Peer Monitor Module
//!
//! Tracks which peer endpoints the store is linked to, reconnects when the
//! node is isolated, and publishes a heartbeat for this node's identity.

use chrono::Utc;
use fraudnet_protocol::{paths, Heartbeat};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::identity::IdentityManager;
use crate::store::{GraphError, GraphStore, PeerEvent};

/// Last known state of a peer endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    /// Seen before, not linked at the last sample
    Unknown,
}

/// Peer endpoints by state, shared between the monitor and the publisher
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    inner: Arc<RwLock<HashMap<String, PeerState>>>,
}

/// Joins and leaves between two samples
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDiff {
    pub joined: Vec<String>,
    pub left: Vec<String>,
}

impl PeerDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connected(&self) -> Vec<String> {
        let peers = self.inner.read().await;
        let mut connected: Vec<String> = peers
            .iter()
            .filter(|(_, state)| **state == PeerState::Connected)
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        connected.sort();
        connected
    }

    /// True when no endpoint is currently connected.
    pub async fn is_empty(&self) -> bool {
        !self
            .inner
            .read()
            .await
            .values()
            .any(|state| *state == PeerState::Connected)
    }

    pub async fn state(&self, endpoint: &str) -> Option<PeerState> {
        self.inner.read().await.get(endpoint).copied()
    }

    /// Mark `live` as connected and everything else as unknown.
    pub async fn update(&self, live: &[String]) -> PeerDiff {
        let mut peers = self.inner.write().await;
        let mut diff = PeerDiff::default();

        for (endpoint, state) in peers.iter_mut() {
            if *state == PeerState::Connected && !live.contains(endpoint) {
                *state = PeerState::Unknown;
                diff.left.push(endpoint.clone());
            }
        }

        for endpoint in live {
            let previous = peers.insert(endpoint.clone(), PeerState::Connected);
            if previous != Some(PeerState::Connected) {
                diff.joined.push(endpoint.clone());
            }
        }

        diff.left.sort();
        diff
    }
}

/// Monitor intervals
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub sample_interval: Duration,
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

pub struct PeerMonitor {
    store: Arc<dyn GraphStore>,
    identity: Arc<IdentityManager>,
    peers: PeerSet,
    endpoints: Vec<String>,
    config: MonitorConfig,
}

impl PeerMonitor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        identity: Arc<IdentityManager>,
        peers: PeerSet,
        endpoints: Vec<String>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            identity,
            peers,
            endpoints,
            config,
        }
    }

    /// Diff the store's live links against the previous sample.
    pub async fn sample(&self) -> PeerDiff {
        let live = self.store.live_peers();
        let diff = self.peers.update(&live).await;

        for endpoint in &diff.joined {
            info!("Peer joined: {}", endpoint);
        }
        for endpoint in &diff.left {
            info!("Peer left: {}", endpoint);
        }

        diff
    }

    /// Reconnect to the configured endpoints when no peer is linked.
    ///
    /// Returns the number of new links.
    pub async fn check_reconnect(&self) -> usize {
        if !self.store.live_peers().is_empty() {
            return 0;
        }

        debug!("No live peers, reconnecting to {:?}", self.endpoints);
        let linked = self.store.connect(&self.endpoints).await;
        if linked > 0 {
            info!("Reconnected to {} peers", linked);
        }
        linked
    }

    /// Write this node's heartbeat. Returns `false` before authentication.
    pub async fn heartbeat(&self) -> Result<bool, GraphError> {
        let Some(identity) = self.identity.current().await else {
            return Ok(false);
        };

        let heartbeat = Heartbeat {
            public_key: identity.public_key.clone(),
            alias: identity.alias.clone(),
            timestamp: Utc::now().timestamp_millis(),
        };
        self.store
            .put(
                &paths::heartbeat(&identity.public_key),
                serde_json::to_value(&heartbeat)?,
            )
            .await?;

        debug!("Heartbeat written for {}", identity.alias);
        Ok(true)
    }

    /// Run the monitor until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut sample = interval(self.config.sample_interval);
        let mut reconnect = interval(self.config.reconnect_interval);
        let mut heartbeat = interval(self.config.heartbeat_interval);
        for timer in [&mut sample, &mut reconnect, &mut heartbeat] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        let mut events = self.store.peer_events();

        info!("Peer monitor started");

        loop {
            tokio::select! {
                _ = sample.tick() => {
                    self.sample().await;
                }
                _ = reconnect.tick() => {
                    self.check_reconnect().await;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!("Failed to write heartbeat: {}", e);
                    }
                }
                event = events.recv() => match event {
                    Ok(PeerEvent::Connected { endpoint }) => info!("Connected to peer {}", endpoint),
                    Ok(PeerEvent::Disconnected { endpoint }) => info!("Disconnected from peer {}", endpoint),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Peer monitor skipped {} connectivity events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Store closed its connectivity events");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Peer monitor stopped");
    }
}
