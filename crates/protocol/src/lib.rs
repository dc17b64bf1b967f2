//! Fraudnet protocol types
//!
//! This crate defines the data exchanged between fraudnet nodes: alert
//! records, signed envelopes, audit entries, and the signing primitive used
//! to produce and check envelopes. It also fixes the well-known graph paths
//! every node reads and writes.

pub mod alert;
pub mod audit;
pub mod envelope;
pub mod errors;
pub mod signing;

pub use alert::{AlertDraft, AlertRecord, Heartbeat, LatestPointer, DEFAULT_ALERT_TYPE};
pub use audit::AuditEntry;
pub use envelope::{KeyPair, SignedEnvelope};
pub use errors::ProtocolError;
pub use signing::{Ed25519Signer, SigningPrimitive};

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Version of the fraudnet protocol
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Well-known graph paths.
pub mod paths {
    /// Shared collection every node appends envelopes to and listens on.
    pub const ALERT_COLLECTION: &str = "fraud-firewall";
    /// Keyed envelopes, one per alert id.
    pub const ALERTS_BY_ID: &str = "fraud-alerts";
    /// Latest-alert discovery pointer.
    pub const LATEST_ALERT: &str = "fraud-meta/latest";
    /// Node heartbeats, keyed by public key.
    pub const HEARTBEATS: &str = "fraud-heartbeats";
    /// User records, keyed by alias.
    pub const USERS_BY_ALIAS: &str = "~@";
    /// Alias index, keyed by public key.
    pub const USERS_BY_KEY: &str = "~";

    /// Keyed envelope path for an alert id.
    pub fn alert(id: &str) -> String {
        format!("{}/{}", ALERTS_BY_ID, id)
    }

    pub fn heartbeat(public_key: &str) -> String {
        format!("{}/{}", HEARTBEATS, public_key)
    }

    pub fn user(alias: &str) -> String {
        format!("{}/{}", USERS_BY_ALIAS, alias)
    }

    pub fn user_key(public_key: &str) -> String {
        format!("{}/{}", USERS_BY_KEY, public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert!(!PROTOCOL_VERSION.is_empty());
    }

    #[test]
    fn test_paths() {
        assert_eq!(paths::alert("fraud-1"), "fraud-alerts/fraud-1");
        assert_eq!(paths::user("node_1"), "~@/node_1");
        assert_eq!(paths::user_key("abcd"), "~/abcd");
    }
}
