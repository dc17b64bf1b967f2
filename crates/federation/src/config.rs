//! Node configuration
//!
//! Everything a node reads at startup: where its state lives, where it
//! listens, which endpoints it dials and the component timings.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::audit::AUDIT_LOG_FILE;
use crate::identity::{IdentityConfig, CREDENTIALS_FILE};
use crate::monitor::MonitorConfig;
use crate::publisher::PublisherConfig;
use crate::relay::RELAY_KEYPAIR_FILE;
use crate::transport::endpoint_url;
use crate::verifier::VerifierConfig;

/// Default gossip port of the relay
pub const DEFAULT_RELAY_PORT: u16 = 3031;

/// Default data directory
pub const DEFAULT_DATA_DIR: &str = ".fraudnet";

/// Subdirectory holding the local graph replica
pub const GRAPH_DIR: &str = "graph";

/// Configuration for a fraudnet node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory for credentials, audit log and the graph replica
    pub data_dir: PathBuf,
    /// Gossip listen address; `None` dials out only
    pub listen_addr: Option<SocketAddr>,
    /// Relay host from `RELAY_HOST`
    pub relay_host: Option<String>,
    /// Relay port from `PORT_RELAY`
    pub relay_port: u16,
    /// Override for the detected local IP (`LOCAL_IP`)
    pub local_ip: Option<IpAddr>,
    /// Extra endpoints given on the command line
    pub peers: Vec<String>,
    pub identity: IdentityConfig,
    pub publisher: PublisherConfig,
    pub verifier: VerifierConfig,
    pub monitor: MonitorConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            listen_addr: None,
            relay_host: None,
            relay_port: DEFAULT_RELAY_PORT,
            local_ip: None,
            peers: Vec::new(),
            identity: IdentityConfig::default(),
            publisher: PublisherConfig::default(),
            verifier: VerifierConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join(CREDENTIALS_FILE)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join(AUDIT_LOG_FILE)
    }

    pub fn relay_keypair_path(&self) -> PathBuf {
        self.data_dir.join(RELAY_KEYPAIR_FILE)
    }

    pub fn graph_path(&self) -> PathBuf {
        self.data_dir.join(GRAPH_DIR)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Endpoint other nodes reach this one at, when listening.
    pub fn advertised_endpoint(&self) -> Option<String> {
        self.listen_addr.map(|addr| {
            let host = if addr.ip().is_unspecified() {
                self.local_ip.unwrap_or_else(detect_local_ip)
            } else {
                addr.ip()
            };
            endpoint_url(&host.to_string(), addr.port())
        })
    }

    /// Endpoints to dial: the relay, this host's IP and localhost on the
    /// relay port, then explicit peers. Duplicates are removed.
    pub fn peer_endpoints(&self) -> Vec<String> {
        let local_ip = self.local_ip.unwrap_or_else(detect_local_ip);

        let mut candidates = Vec::new();
        if let Some(host) = &self.relay_host {
            candidates.push(endpoint_url(host, self.relay_port));
        }
        candidates.push(endpoint_url(&local_ip.to_string(), self.relay_port));
        candidates.push(endpoint_url("127.0.0.1", self.relay_port));
        candidates.extend(self.peers.iter().cloned());

        let mut endpoints: Vec<String> = Vec::new();
        for candidate in candidates {
            if !endpoints.contains(&candidate) {
                endpoints.push(candidate);
            }
        }
        endpoints
    }
}

/// Best guess at this host's outward facing IPv4 address.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
/// Falls back to loopback when there is no route.
pub fn detect_local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            debug!("Local IP detection failed: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
