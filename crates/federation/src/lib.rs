//! Fraudnet federation layer
//!
//! Propagates signed fraud alerts between nodes over a replicated graph.
//! Each node authenticates an identity, publishes signed alerts, verifies
//! alerts from peers into an audit log and keeps its peer links alive.

pub mod audit;
pub mod config;
pub mod gossip;
pub mod identity;
pub mod monitor;
pub mod node;
pub mod publisher;
pub mod relay;
pub mod retry;
pub mod storage;
pub mod store;
pub mod transport;
pub mod verifier;

pub use audit::{AuditError, AuditLog, AuditWrite};
pub use config::{detect_local_ip, NodeConfig, DEFAULT_RELAY_PORT};
pub use gossip::{Dialer, GossipMessage, GraphEntry, Mesh, NoDialer};
pub use identity::{
    AuthError, Credentials, IdentityConfig, IdentityError, IdentityManager, IdentityState,
    NodeIdentity,
};
pub use monitor::{MonitorConfig, PeerDiff, PeerMonitor, PeerSet, PeerState};
pub use node::FraudNode;
pub use publisher::{AlertSink, PublishError, Publisher, PublisherConfig};
pub use relay::{Relay, RelayError};
pub use retry::{retry, Backoff, Retried, RetryError, RetryPolicy, Retryable};
pub use storage::LocalGraph;
pub use store::{GraphError, GraphStore, PeerEvent, Subscription};
pub use transport::{serve, TcpDialer};
pub use verifier::{IgnoreReason, Verifier, VerifierConfig, VerifyOutcome};
