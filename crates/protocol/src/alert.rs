//! Fraud alert records.
//!
//! An [`AlertDraft`] is what collaborators hand to the publisher (an HTTP
//! layer, a payment poller, the CLI). The publisher completes it into an
//! [`AlertRecord`], which is immutable once signed.

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;

/// Alert type used when the caller does not supply one.
pub const DEFAULT_ALERT_TYPE: &str = "fraud";

/// Length of the random suffix in generated alert ids.
const ID_SUFFIX_LEN: usize = 7;

/// Keys owned by the record and audit layers. Domain fields using these
/// names are dropped so they cannot shadow the canonical values.
const RESERVED_KEYS: &[&str] = &[
    "id",
    "amount",
    "type",
    "timestamp",
    "createdAt",
    "verifiedAt",
    "receivedAt",
    "verificationAttempts",
];

/// Inbound alert shape: `{id?, amount, type?, timestamp?, ...}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertDraft {
    /// Caller-chosen id, generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Transaction amount
    pub amount: f64,
    /// Alert category (e.g. "geo-anomaly")
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub alert_type: Option<String>,
    /// Unix timestamp in milliseconds, generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Remaining domain fields, carried through untouched
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl AlertDraft {
    /// Draft with just an amount and a type.
    pub fn new(amount: f64, alert_type: impl Into<String>) -> Self {
        Self {
            amount,
            alert_type: Some(alert_type.into()),
            ..Default::default()
        }
    }

    /// Set an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a domain field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Reject drafts that cannot round-trip through the graph.
    ///
    /// The id becomes a graph key, so it may not contain the path separator.
    /// JSON has no encoding for a non-finite amount.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(id) = &self.id {
            if id.contains('/') {
                return Err(ProtocolError::ValidationFailed {
                    reason: format!("alert id {:?} contains '/'", id),
                });
            }
        }
        if !self.amount.is_finite() {
            return Err(ProtocolError::ValidationFailed {
                reason: format!("amount {} is not a finite number", self.amount),
            });
        }
        Ok(())
    }
}

/// A complete fraud alert, ready to be signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub id: String,
    pub amount: f64,
    #[serde(rename = "type")]
    pub alert_type: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// ISO 8601 creation time
    pub created_at: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl AlertRecord {
    /// Complete a draft using the current time.
    pub fn from_draft(draft: AlertDraft) -> Self {
        Self::from_draft_at(draft, Utc::now())
    }

    /// Complete a draft as of `now`.
    pub fn from_draft_at(draft: AlertDraft, now: DateTime<Utc>) -> Self {
        let timestamp = draft.timestamp.unwrap_or_else(|| now.timestamp_millis());
        let id = draft
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Self::generate_id(timestamp));

        let mut fields = draft.fields;
        fields.retain(|key, _| !RESERVED_KEYS.contains(&key.as_str()));

        AlertRecord {
            id,
            amount: draft.amount,
            alert_type: draft
                .alert_type
                .unwrap_or_else(|| DEFAULT_ALERT_TYPE.to_string()),
            timestamp,
            created_at: now.to_rfc3339(),
            fields,
        }
    }

    /// Generate an id of the form `fraud-<timestamp>-<suffix>`.
    pub fn generate_id(timestamp: i64) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ID_SUFFIX_LEN)
            .map(|b| (b as char).to_ascii_lowercase())
            .collect();
        format!("fraud-{}-{}", timestamp, suffix)
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Lightweight discovery pointer for this record.
    pub fn latest_pointer(&self, publisher: &str) -> LatestPointer {
        LatestPointer {
            id: self.id.clone(),
            timestamp: self.timestamp,
            alert_type: self.alert_type.clone(),
            amount: self.amount,
            publisher: publisher.to_string(),
        }
    }
}

/// Cheap "latest alert" pointer, readable without fetching the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub id: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub amount: f64,
    /// Alias of the publishing node
    pub publisher: String,
}

/// Liveness advertisement written periodically by each node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub public_key: String,
    pub alias: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_draft_completion_generates_id_and_timestamp() {
        let now = Utc::now();
        let record = AlertRecord::from_draft_at(AlertDraft::new(500.0, "geo-anomaly"), now);

        assert_eq!(record.timestamp, now.timestamp_millis());
        assert!(record.id.starts_with(&format!("fraud-{}-", record.timestamp)));
        assert_eq!(record.id.len(), format!("fraud-{}-", record.timestamp).len() + 7);
        assert_eq!(record.alert_type, "geo-anomaly");
        assert_eq!(record.created_at, now.to_rfc3339());
    }

    #[test]
    fn test_draft_keeps_caller_id_and_timestamp() {
        let draft = AlertDraft {
            id: Some("fraud-1".to_string()),
            amount: 12.5,
            alert_type: None,
            timestamp: Some(42),
            fields: Map::new(),
        };
        let record = AlertRecord::from_draft(draft);

        assert_eq!(record.id, "fraud-1");
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.alert_type, DEFAULT_ALERT_TYPE);
    }

    #[test]
    fn test_inbound_shape_and_domain_fields() {
        let draft: AlertDraft = serde_json::from_value(json!({
            "amount": 500,
            "type": "geo-anomaly",
            "riskScore": 0.91,
            "createdAt": "spoofed",
            "location": { "lat": 37.7749, "lon": -122.4194 }
        }))
        .unwrap();

        let record = AlertRecord::from_draft(draft);
        let value = record.to_value().unwrap();

        assert_eq!(value["riskScore"], json!(0.91));
        assert_eq!(value["location"]["lat"], json!(37.7749));
        assert_ne!(value["createdAt"], json!("spoofed"));
        assert_eq!(value["type"], json!("geo-anomaly"));

        let back = AlertRecord::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_validate_rejects_unroutable_drafts() {
        assert!(AlertDraft::new(10.0, "fraud").with_id("fraud-1").validate().is_ok());
        assert!(AlertDraft::new(10.0, "fraud").validate().is_ok());

        let nested = AlertDraft::new(10.0, "fraud").with_id("fraud/1");
        assert!(matches!(
            nested.validate(),
            Err(ProtocolError::ValidationFailed { .. })
        ));
        assert!(AlertDraft::new(f64::NAN, "fraud").validate().is_err());
        assert!(AlertDraft::new(f64::NEG_INFINITY, "fraud").validate().is_err());
    }

    #[test]
    fn test_latest_pointer() {
        let record = AlertRecord::from_draft(AlertDraft::new(75.0, "velocity").with_id("fraud-7"));
        let pointer = record.latest_pointer("node_1");

        assert_eq!(pointer.id, "fraud-7");
        assert_eq!(pointer.amount, 75.0);
        assert_eq!(pointer.publisher, "node_1");
    }
}
