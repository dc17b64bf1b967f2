//! Signing primitive.
//!
//! [`SigningPrimitive`] is the seam between the propagation engine and the
//! cryptography it relies on. [`Ed25519Signer`] is the default implementation.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::Value;

use crate::envelope::{KeyPair, SignedEnvelope};
use crate::errors::ProtocolError;

/// Keypair generation, signing and verification.
///
/// `verify` returns `Ok(None)` when the signature does not match, and `Err`
/// when the envelope or key cannot be decoded at all. Callers treat both as
/// a failed verification.
pub trait SigningPrimitive: Send + Sync {
    /// Generate a fresh keypair.
    fn generate_keypair(&self) -> KeyPair;

    /// Sign `payload` with the private half of `keypair`.
    fn sign(&self, payload: &Value, keypair: &KeyPair) -> Result<SignedEnvelope, ProtocolError>;

    /// Verify `envelope` against `public_key`, returning the payload on success.
    fn verify(
        &self,
        envelope: &SignedEnvelope,
        public_key: &str,
    ) -> Result<Option<Value>, ProtocolError>;
}

/// Ed25519 signing primitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Signer;

impl Ed25519Signer {
    fn signing_key(keypair: &KeyPair) -> Result<SigningKey, ProtocolError> {
        let bytes = hex::decode(&keypair.private_key).map_err(|_| ProtocolError::InvalidFormat {
            reason: "Invalid private key hex".to_string(),
        })?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidFormat {
                reason: "Invalid private key length".to_string(),
            })?;
        Ok(SigningKey::from_bytes(&seed))
    }

    fn verifying_key(public_key: &str) -> Result<VerifyingKey, ProtocolError> {
        let bytes = hex::decode(public_key).map_err(|_| ProtocolError::InvalidFormat {
            reason: "Invalid public key hex".to_string(),
        })?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidFormat {
                reason: "Invalid public key length".to_string(),
            })?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| ProtocolError::CryptographicError {
            reason: e.to_string(),
        })
    }
}

impl SigningPrimitive for Ed25519Signer {
    fn generate_keypair(&self) -> KeyPair {
        let signing_key = SigningKey::generate(&mut OsRng);
        KeyPair {
            public_key: hex::encode(signing_key.verifying_key().as_bytes()),
            private_key: hex::encode(signing_key.to_bytes()),
        }
    }

    fn sign(&self, payload: &Value, keypair: &KeyPair) -> Result<SignedEnvelope, ProtocolError> {
        let signing_key = Self::signing_key(keypair)?;
        let public_key = hex::encode(signing_key.verifying_key().as_bytes());
        if public_key != keypair.public_key {
            return Err(ProtocolError::ValidationFailed {
                reason: "Keypair halves do not match".to_string(),
            });
        }

        let payload = serde_json::to_string(payload)?;
        let signature = signing_key.sign(&SignedEnvelope::signing_message(&payload));

        Ok(SignedEnvelope {
            payload,
            signature: hex::encode(signature.to_bytes()),
            signer_public_key: public_key,
            signer_alias: None,
        })
    }

    fn verify(
        &self,
        envelope: &SignedEnvelope,
        public_key: &str,
    ) -> Result<Option<Value>, ProtocolError> {
        let verifying_key = Self::verifying_key(public_key)?;

        let signature_bytes =
            hex::decode(&envelope.signature).map_err(|_| ProtocolError::InvalidFormat {
                reason: "Invalid signature hex".to_string(),
            })?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| ProtocolError::InvalidFormat {
                reason: "Invalid signature format".to_string(),
            })?;

        let message = SignedEnvelope::signing_message(&envelope.payload);
        match verifying_key.verify(&message, &signature) {
            Ok(()) => Ok(Some(serde_json::from_str(&envelope.payload)?)),
            Err(_) => Ok(None),
        }
    }
}
