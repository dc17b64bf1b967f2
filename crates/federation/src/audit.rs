//! Audit log of verified alerts
//!
//! A JSON array on disk holding at most one entry per alert id. Writes are
//! serialized through an async mutex and rewritten via a temp file plus
//! rename, so a crash mid-write leaves the previous array intact. Only one
//! process may write a given log.

use chrono::Utc;
use fraudnet_protocol::AuditEntry;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// Default audit log file name inside the data directory
pub const AUDIT_LOG_FILE: &str = "audit-log.json";

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit log I/O error at {path}: {source}")]
    Io { path: String, source: io::Error },

    #[error("Audit log at {path} is not a valid entry array: {source}")]
    Format {
        path: String,
        source: serde_json::Error,
    },
}

/// What [`AuditLog::record`] did with an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditWrite {
    /// First entry for this id
    Added,
    /// The id was logged with a different payload, now overwritten in place
    Replaced,
    /// The id was already logged with this payload
    Unchanged,
}

impl AuditWrite {
    /// Whether the file was rewritten.
    pub fn is_written(self) -> bool {
        !matches!(self, AuditWrite::Unchanged)
    }
}

pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log `entry`, keeping one entry per id.
    ///
    /// A new id is appended with `receivedAt` stamped here. A logged id keeps
    /// its position and `receivedAt`; its payload and verification data are
    /// replaced when the payload differs.
    pub async fn record(&self, mut entry: AuditEntry) -> Result<AuditWrite, AuditError> {
        let _guard = self.lock.lock().await;

        let mut entries = self.load().await?;
        let write = match entries.iter_mut().find(|existing| existing.id() == entry.id()) {
            Some(existing) if existing.record == entry.record => {
                debug!("Alert {} already audited", entry.id());
                return Ok(AuditWrite::Unchanged);
            }
            Some(existing) => {
                debug!("Alert {} audited with a newer payload", entry.id());
                entry.received_at = existing.received_at.take();
                *existing = entry;
                AuditWrite::Replaced
            }
            None => {
                entry.received_at = Some(Utc::now().to_rfc3339());
                entries.push(entry);
                AuditWrite::Added
            }
        };

        self.write(&entries).await?;
        Ok(write)
    }

    /// All logged entries, oldest first.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    pub async fn contains(&self, id: &str) -> Result<bool, AuditError> {
        Ok(self.entries().await?.iter().any(|entry| entry.id() == id))
    }

    pub async fn len(&self) -> Result<usize, AuditError> {
        Ok(self.entries().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, AuditError> {
        Ok(self.len().await? == 0)
    }

    fn io_error(&self, source: io::Error) -> AuditError {
        AuditError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    async fn load(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&contents).map_err(|source| AuditError::Format {
            path: self.path.display().to_string(),
            source,
        })
    }

    async fn write(&self, entries: &[AuditEntry]) -> Result<(), AuditError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error(e))?;
            }
        }

        let json = serde_json::to_vec_pretty(entries).map_err(|source| AuditError::Format {
            path: self.path.display().to_string(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(())
    }
}
