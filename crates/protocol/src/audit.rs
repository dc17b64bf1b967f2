//! Audit entries: verified alerts plus verification metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::AlertRecord;

/// A verified alert as recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    #[serde(flatten)]
    pub record: AlertRecord,
    /// ISO 8601 time the signature was accepted
    pub verified_at: String,
    /// ISO 8601 time the entry was appended, set by the audit log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,
    /// Number of verify calls it took to accept the signature
    pub verification_attempts: u32,
}

impl AuditEntry {
    /// Entry for a record verified at `verified_at`.
    pub fn verified(record: AlertRecord, verified_at: DateTime<Utc>, attempts: u32) -> Self {
        AuditEntry {
            record,
            verified_at: verified_at.to_rfc3339(),
            received_at: None,
            verification_attempts: attempts,
        }
    }

    /// Alert id, the deduplication key.
    pub fn id(&self) -> &str {
        &self.record.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertDraft;
    use serde_json::json;

    #[test]
    fn test_audit_entry_flattens_record() {
        let record = AlertRecord::from_draft(
            AlertDraft::new(500.0, "geo-anomaly")
                .with_id("fraud-1")
                .with_field("nodeId", "node-alpha"),
        );
        let entry = AuditEntry::verified(record, Utc::now(), 2);

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["id"], json!("fraud-1"));
        assert_eq!(value["nodeId"], json!("node-alpha"));
        assert_eq!(value["verificationAttempts"], json!(2));
        assert!(value.get("receivedAt").is_none());

        let back: AuditEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
        assert_eq!(back.id(), "fraud-1");
    }
}
