//! Node Identity Module
//!
//! Owns this node's alias and keypair. On startup the persisted credentials
//! are used to authenticate against the user record in the graph; when that
//! fails irrecoverably the credentials are discarded and a fresh identity is
//! registered.
//!
//! The user record keeps the private key sealed under the passphrase, so the
//! credentials file only has to hold `{alias, passphrase}`.

use chrono::Utc;
use fraudnet_protocol::{paths, KeyPair, SigningPrimitive};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::retry::{retry, RetryPolicy, Retryable};
use crate::store::GraphStore;

/// Default credentials file name inside the data directory
pub const CREDENTIALS_FILE: &str = "identity.json";

/// blake3 key-derivation context for sealing private keys.
const SEAL_CONTEXT: &str = "fraudnet 2024-06 user key seal v1";

/// Authentication failures against the graph
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Unknown user: {alias}")]
    UnknownUser { alias: String },

    #[error("Wrong passphrase for {alias}")]
    BadPassphrase { alias: String },

    #[error("Corrupt user record for {alias}: {reason}")]
    CorruptRecord { alias: String, reason: String },

    #[error("Timed out fetching user record for {alias}")]
    Timeout { alias: String },

    #[error("Store error: {reason}")]
    Store { reason: String },
}

impl Retryable for AuthError {
    fn is_retryable(&self) -> bool {
        !matches!(self, AuthError::UnknownUser { .. })
    }
}

/// Identity bootstrap errors
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Credential file error at {path}: {source}")]
    CredentialIo { path: String, source: io::Error },

    #[error("Credential encoding error: {source}")]
    CredentialEncoding { source: serde_json::Error },

    #[error("Registration failed for {alias}: {reason}")]
    Registration { alias: String, reason: String },

    #[error("Identity bootstrap gave up after {attempts} identity creations")]
    RegenerationLimit { attempts: u32 },
}

/// Lifecycle of the node identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    Uninitialized,
    Creating,
    Authenticating,
    Authenticated,
}

/// Persisted login for this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub alias: String,
    pub passphrase: String,
}

/// User record stored in the graph under `~@/<alias>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub alias: String,
    pub public_key: String,
    /// Private key material XORed with a passphrase-derived keystream
    pub sealed_key: String,
    pub salt: String,
    /// blake3 of the unsealed private key material
    pub check: String,
}

impl UserRecord {
    /// Seal `keypair` under `passphrase`.
    pub fn seal(alias: &str, keypair: &KeyPair, passphrase: &str) -> Self {
        let salt: [u8; 16] = rand::random();
        let plain = keypair.private_key.as_bytes();
        let sealed: Vec<u8> = plain
            .iter()
            .zip(Self::keystream(&salt, passphrase, plain.len()))
            .map(|(p, k)| p ^ k)
            .collect();

        UserRecord {
            alias: alias.to_string(),
            public_key: keypair.public_key.clone(),
            sealed_key: hex::encode(sealed),
            salt: hex::encode(salt),
            check: blake3::hash(plain).to_hex().to_string(),
        }
    }

    /// Recover the keypair with `passphrase`.
    pub fn unseal(&self, passphrase: &str) -> Result<KeyPair, AuthError> {
        let corrupt = |reason: &str| AuthError::CorruptRecord {
            alias: self.alias.clone(),
            reason: reason.to_string(),
        };

        let salt = hex::decode(&self.salt).map_err(|_| corrupt("invalid salt hex"))?;
        let sealed = hex::decode(&self.sealed_key).map_err(|_| corrupt("invalid sealed key hex"))?;

        let plain: Vec<u8> = sealed
            .iter()
            .zip(Self::keystream(&salt, passphrase, sealed.len()))
            .map(|(s, k)| s ^ k)
            .collect();

        if blake3::hash(&plain).to_hex().as_str() != self.check {
            return Err(AuthError::BadPassphrase {
                alias: self.alias.clone(),
            });
        }

        let private_key = String::from_utf8(plain).map_err(|_| corrupt("key is not utf-8"))?;
        Ok(KeyPair {
            public_key: self.public_key.clone(),
            private_key,
        })
    }

    // Not a password-hardening KDF; passphrases are random, not user chosen.
    fn keystream(salt: &[u8], passphrase: &str, len: usize) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new_derive_key(SEAL_CONTEXT);
        hasher.update(salt);
        hasher.update(passphrase.as_bytes());
        let mut out = vec![0u8; len];
        hasher.finalize_xof().fill(&mut out);
        out
    }
}

/// Authenticated identity of this node
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub alias: String,
    pub public_key: String,
    keypair: KeyPair,
}

impl NodeIdentity {
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }
}

/// Identity bootstrap settings
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Authentication retries (3 attempts, linear 1s backoff)
    pub auth_policy: RetryPolicy,
    /// Bound on a single user record fetch
    pub auth_timeout: Duration,
    /// Identity creations allowed before bootstrap gives up
    pub max_creations: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            auth_policy: RetryPolicy::linear(3, Duration::from_secs(1)),
            auth_timeout: Duration::from_secs(5),
            max_creations: 3,
        }
    }
}

/// Manages the node identity lifecycle
pub struct IdentityManager {
    store: Arc<dyn GraphStore>,
    signer: Arc<dyn SigningPrimitive>,
    credentials_path: PathBuf,
    config: IdentityConfig,
    state: RwLock<IdentityState>,
    identity: RwLock<Option<Arc<NodeIdentity>>>,
}

impl IdentityManager {
    pub fn new(
        store: Arc<dyn GraphStore>,
        signer: Arc<dyn SigningPrimitive>,
        credentials_path: impl Into<PathBuf>,
        config: IdentityConfig,
    ) -> Self {
        Self {
            store,
            signer,
            credentials_path: credentials_path.into(),
            config,
            state: RwLock::new(IdentityState::Uninitialized),
            identity: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> IdentityState {
        *self.state.read().await
    }

    /// The authenticated identity, if bootstrap has completed.
    pub async fn current(&self) -> Option<Arc<NodeIdentity>> {
        self.identity.read().await.clone()
    }

    /// Authenticate with persisted credentials, creating a new identity when
    /// there are none or they no longer work.
    pub async fn init_identity(&self) -> Result<Arc<NodeIdentity>, IdentityError> {
        let mut creations = 0;

        loop {
            if let Some(credentials) = self.load_credentials().await? {
                self.set_state(IdentityState::Authenticating).await;

                let login = &credentials;
                match retry(&self.config.auth_policy, move |_| async move {
                    self.authenticate(login).await.map(Some)
                })
                .await
                {
                    Ok(authenticated) => {
                        let identity = Arc::new(authenticated.value);
                        *self.identity.write().await = Some(identity.clone());
                        self.set_state(IdentityState::Authenticated).await;
                        info!("Authenticated as {}", identity.alias);
                        return Ok(identity);
                    }
                    Err(e) => {
                        warn!(
                            "Authentication as {} failed ({}), recreating identity",
                            credentials.alias, e
                        );
                        self.discard_credentials().await?;
                    }
                }
            }

            if creations >= self.config.max_creations {
                return Err(IdentityError::RegenerationLimit {
                    attempts: creations,
                });
            }
            creations += 1;

            self.set_state(IdentityState::Creating).await;
            match self.create_identity().await {
                Ok(alias) => info!("Identity created: {}", alias),
                Err(e @ IdentityError::Registration { .. }) => warn!("{}", e),
                Err(e) => return Err(e),
            }
        }
    }

    async fn set_state(&self, state: IdentityState) {
        *self.state.write().await = state;
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<NodeIdentity, AuthError> {
        let alias = credentials.alias.clone();
        let fetched = timeout(self.config.auth_timeout, self.store.get(&paths::user(&alias)))
            .await
            .map_err(|_| AuthError::Timeout {
                alias: alias.clone(),
            })?
            .map_err(|e| AuthError::Store {
                reason: e.to_string(),
            })?;

        let value = fetched.ok_or_else(|| AuthError::UnknownUser {
            alias: alias.clone(),
        })?;
        let record: UserRecord =
            serde_json::from_value(value).map_err(|e| AuthError::CorruptRecord {
                alias: alias.clone(),
                reason: e.to_string(),
            })?;

        let keypair = record.unseal(&credentials.passphrase)?;
        Ok(NodeIdentity {
            alias,
            public_key: keypair.public_key.clone(),
            keypair,
        })
    }

    /// Register a fresh alias and persist its credentials.
    async fn create_identity(&self) -> Result<String, IdentityError> {
        let alias = generate_alias();
        let passphrase = generate_passphrase();
        let keypair = self.signer.generate_keypair();
        let registration = |reason: String| IdentityError::Registration {
            alias: alias.clone(),
            reason,
        };

        let user_path = paths::user(&alias);
        match self.store.get(&user_path).await {
            Ok(None) => {}
            Ok(Some(_)) => return Err(registration("alias already registered".to_string())),
            Err(e) => return Err(registration(e.to_string())),
        }

        let record = UserRecord::seal(&alias, &keypair, &passphrase);
        let value = serde_json::to_value(&record)
            .map_err(|source| IdentityError::CredentialEncoding { source })?;
        self.store
            .put(&user_path, value)
            .await
            .map_err(|e| registration(e.to_string()))?;

        if let Err(e) = self
            .store
            .put(&paths::user_key(&keypair.public_key), json!({ "alias": alias }))
            .await
        {
            warn!("Failed to index alias {}: {}", alias, e);
        }

        self.save_credentials(&Credentials {
            alias: alias.clone(),
            passphrase,
        })
        .await?;
        Ok(alias)
    }

    fn credential_io(&self, source: io::Error) -> IdentityError {
        IdentityError::CredentialIo {
            path: self.credentials_path.display().to_string(),
            source,
        }
    }

    /// Read persisted credentials. A file that does not parse is discarded.
    async fn load_credentials(&self) -> Result<Option<Credentials>, IdentityError> {
        let path = &self.credentials_path;
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.credential_io(e)),
        };

        match serde_json::from_str(&contents) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(e) => {
                warn!("Credential file {} is corrupted ({}), discarding", path.display(), e);
                self.discard_credentials().await?;
                Ok(None)
            }
        }
    }

    async fn save_credentials(&self, credentials: &Credentials) -> Result<(), IdentityError> {
        let path = &self.credentials_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.credential_io(e))?;
        }

        let json = serde_json::to_string_pretty(credentials)
            .map_err(|source| IdentityError::CredentialEncoding { source })?;
        fs::write(path, json)
            .await
            .map_err(|e| self.credential_io(e))?;
        restrict_permissions(path)
            .await
            .map_err(|e| self.credential_io(e))?;
        Ok(())
    }

    async fn discard_credentials(&self) -> Result<(), IdentityError> {
        match fs::remove_file(&self.credentials_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.credential_io(e)),
        }
    }
}

/// Make a file holding key material readable by its owner only.
#[cfg(unix)]
pub(crate) async fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
pub(crate) async fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn generate_alias() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("node_{}_{}", Utc::now().timestamp_millis(), suffix)
}

fn generate_passphrase() -> String {
    format!("pass_{}", hex::encode(rand::random::<[u8; 16]>()))
}
