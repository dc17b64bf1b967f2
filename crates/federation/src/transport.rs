//! TCP transport for gossip links.
//!
//! Frames are newline-delimited JSON [`GossipMessage`]s. The dialing side
//! opens with `Hello` so the accepting side knows which endpoint the link
//! belongs to.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::gossip::{Dialer, GossipMessage, Link};
use crate::storage::LocalGraph;
use crate::store::GraphError;

/// Scheme used for gossip endpoints
pub const ENDPOINT_SCHEME: &str = "tcp";

/// Format a gossip endpoint URL.
pub fn endpoint_url(host: &str, port: u16) -> String {
    format!("{}://{}:{}", ENDPOINT_SCHEME, host, port)
}

/// Extract `(host, port)` from a `tcp://host:port` endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), GraphError> {
    let unreachable = |reason: &str| GraphError::Unreachable {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(endpoint).map_err(|e| unreachable(&e.to_string()))?;
    if url.scheme() != ENDPOINT_SCHEME {
        return Err(unreachable("unsupported scheme"));
    }
    let host = url.host_str().ok_or_else(|| unreachable("missing host"))?;
    let port = url.port().ok_or_else(|| unreachable("missing port"))?;
    Ok((host.to_string(), port))
}

/// Dials peers over TCP.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, endpoint: &str, local: &LocalGraph) -> Result<Link, GraphError> {
        let (host, port) = parse_endpoint(endpoint)?;
        let unreachable = |reason: String| GraphError::Unreachable {
            endpoint: endpoint.to_string(),
            reason,
        };

        let stream = timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| unreachable("connect timed out".to_string()))?
            .map_err(|e| unreachable(e.to_string()))?;

        let local_endpoint = match local.endpoint() {
            Some(endpoint) => endpoint.to_string(),
            None => stream
                .local_addr()
                .map(|addr| endpoint_url(&addr.ip().to_string(), addr.port()))
                .map_err(|e| unreachable(e.to_string()))?,
        };

        let (reader, writer) = stream.into_split();
        let link = spawn_writer(writer, endpoint.to_string());
        link.send(GossipMessage::Hello {
            endpoint: local_endpoint,
        })
        .map_err(|_| unreachable("writer closed".to_string()))?;

        spawn_reader(BufReader::new(reader), local.clone(), endpoint.to_string());
        Ok(link)
    }
}

/// Accept inbound gossip links for `graph` until the listener fails.
pub async fn serve(graph: LocalGraph, listener: TcpListener) -> Result<(), GraphError> {
    let addr = listener.local_addr().map_err(|e| GraphError::Unreachable {
        endpoint: "listener".to_string(),
        reason: e.to_string(),
    })?;
    info!("Gossip listening on {}", addr);

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept gossip connection: {}", e);
                continue;
            }
        };

        let graph = graph.clone();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            let mut reader = BufReader::new(reader);

            let mut first = String::new();
            let endpoint = match reader.read_line(&mut first).await {
                Ok(n) if n > 0 => match serde_json::from_str::<GossipMessage>(&first) {
                    Ok(GossipMessage::Hello { endpoint }) => endpoint,
                    _ => {
                        warn!("Connection from {} did not open with hello", remote);
                        return;
                    }
                },
                _ => return,
            };

            debug!("Accepted gossip link from {} ({})", endpoint, remote);
            let link = spawn_writer(writer, endpoint.clone());
            graph.attach(&endpoint, link);
            read_frames(reader, graph, endpoint).await;
        });
    }
}

fn spawn_writer(mut writer: OwnedWriteHalf, endpoint: String) -> Link {
    let (tx, mut rx) = mpsc::unbounded_channel::<GossipMessage>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to encode gossip message for {}: {}", endpoint, e);
                    continue;
                }
            };
            line.push(b'\n');

            if let Err(e) = writer.write_all(&line).await {
                debug!("Write to {} failed: {}", endpoint, e);
                break;
            }
            if matches!(message, GossipMessage::Bye) {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
    tx
}

fn spawn_reader(reader: BufReader<OwnedReadHalf>, graph: LocalGraph, endpoint: String) {
    tokio::spawn(read_frames(reader, graph, endpoint));
}

async fn read_frames(reader: BufReader<OwnedReadHalf>, graph: LocalGraph, endpoint: String) {
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<GossipMessage>(&line) {
                Ok(message) => graph.ingest(&endpoint, message),
                Err(e) => warn!("Dropping malformed frame from {}: {}", endpoint, e),
            },
            Ok(None) => break,
            Err(e) => {
                debug!("Read from {} failed: {}", endpoint, e);
                break;
            }
        }
    }
    graph.detach(&endpoint);
}
