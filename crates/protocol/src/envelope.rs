//! Signed envelopes.
//!
//! An envelope carries the serialized alert, the signature over it and the
//! signer's public key, so any peer can verify it without a key lookup.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::errors::ProtocolError;

/// Domain separation tag prepended to every signed payload.
const SIGNING_DOMAIN: &str = "FRAUDNET_ALERT_V1";

/// A signed wrapper around a serialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelope {
    /// Serialized payload (JSON text)
    pub payload: String,
    /// Hex-encoded signature over the payload
    pub signature: String,
    /// Hex-encoded public key of the signer
    pub signer_public_key: String,
    /// Alias of the signer, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_alias: Option<String>,
}

impl SignedEnvelope {
    /// Attach the signer alias. The alias is not covered by the signature.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.signer_alias = Some(alias.into());
        self
    }

    /// Same payload, signature and signer key. The alias is ignored.
    pub fn same_content(&self, other: &SignedEnvelope) -> bool {
        self.payload == other.payload
            && self.signature == other.signature
            && self.signer_public_key == other.signer_public_key
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Bytes covered by the signature.
    pub fn signing_message(payload: &str) -> Vec<u8> {
        format!("{}\n{}", SIGNING_DOMAIN, payload).into_bytes()
    }
}

/// Asymmetric keypair, hex encoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub public_key: String,
    #[serde(rename = "privateKeyMaterial")]
    pub private_key: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}
