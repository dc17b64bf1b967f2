//! Alert Verifier Module
//!
//! Listens on the shared alert collection and the keyed alert path, verifies
//! each envelope against the signer key it carries and records accepted
//! alerts in the audit log. Envelopes that never verify are dropped after the
//! retry bound.
//!
//! The audit entry for an id follows the keyed envelope: a verified envelope
//! is only committed while it is still the one stored under
//! `fraud-alerts/<id>`. Every keyed change is itself a notification, so the
//! log settles on whatever payload the store's merge settled on.

use chrono::Utc;
use fraudnet_protocol::{paths, AlertRecord, AuditEntry, SignedEnvelope, SigningPrimitive};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::retry::{retry, RetryPolicy};
use crate::store::{GraphStore, Subscription};

/// Why a notification was skipped without verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotAnObject,
    ReservedKey,
    MissingSigner,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ignored(IgnoreReason),
    /// Signature accepted; `newly_logged` is false when the log already held
    /// this payload or the write failed
    Accepted {
        id: String,
        attempts: u32,
        newly_logged: bool,
    },
    /// Signature accepted but the keyed path now holds a different envelope
    Superseded { id: String },
    Rejected { attempts: u32 },
}

/// Verifier timings
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Pause before the first verify call
    pub settle_delay: Duration,
    /// 5 attempts, fixed 300ms
    pub policy: RetryPolicy,
    /// Notifications verified concurrently
    pub max_in_flight: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
            policy: RetryPolicy::fixed(5, Duration::from_millis(300)),
            max_in_flight: 64,
        }
    }
}

pub struct Verifier {
    store: Arc<dyn GraphStore>,
    signer: Arc<dyn SigningPrimitive>,
    audit: Arc<AuditLog>,
    config: VerifierConfig,
    permits: Arc<Semaphore>,
    // Keyed read and audit write happen as one step
    commit_lock: Mutex<()>,
}

impl Verifier {
    pub fn new(
        store: Arc<dyn GraphStore>,
        signer: Arc<dyn SigningPrimitive>,
        audit: Arc<AuditLog>,
        config: VerifierConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            store,
            signer,
            audit,
            config,
            permits,
            commit_lock: Mutex::new(()),
        }
    }

    /// Process one collection notification.
    pub async fn handle(&self, value: Value, key: &str) -> VerifyOutcome {
        if !value.is_object() {
            return VerifyOutcome::Ignored(IgnoreReason::NotAnObject);
        }
        if key.starts_with('_') || key == "undefined" {
            return VerifyOutcome::Ignored(IgnoreReason::ReservedKey);
        }
        if value.get("signerPublicKey").and_then(Value::as_str).is_none() {
            debug!("Ignoring {}: no signer key", key);
            return VerifyOutcome::Ignored(IgnoreReason::MissingSigner);
        }
        let envelope = match SignedEnvelope::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Ignoring {}: {}", key, e);
                return VerifyOutcome::Ignored(IgnoreReason::Malformed);
            }
        };

        let signer_name = match self.lookup_alias(&envelope.signer_public_key).await {
            Some(alias) => alias,
            None => envelope
                .signer_alias
                .clone()
                .unwrap_or_else(|| short_key(&envelope.signer_public_key)),
        };

        sleep(self.config.settle_delay).await;

        let signer = &self.signer;
        let envelope = &envelope;
        let verified = retry(&self.config.policy, move |_| async move {
            signer.verify(envelope, &envelope.signer_public_key)
        })
        .await;

        let (payload, attempts) = match verified {
            Ok(verified) => (verified.value, verified.attempts),
            Err(e) => {
                warn!(
                    "Alert {} from {} is invalid or tampered ({}), dropping",
                    key, signer_name, e
                );
                return VerifyOutcome::Rejected {
                    attempts: e.attempts(),
                };
            }
        };

        let record = match AlertRecord::from_value(payload) {
            Ok(record) => record,
            Err(e) => {
                warn!("Signed payload {} from {} is not an alert: {}", key, signer_name, e);
                return VerifyOutcome::Ignored(IgnoreReason::Malformed);
            }
        };

        self.commit(envelope, record, attempts, &signer_name).await
    }

    async fn commit(
        &self,
        envelope: &SignedEnvelope,
        record: AlertRecord,
        attempts: u32,
        signer_name: &str,
    ) -> VerifyOutcome {
        let _guard = self.commit_lock.lock().await;
        let id = record.id.clone();

        if let Some(current) = self.keyed_envelope(&id).await {
            if !current.same_content(envelope) {
                debug!("Alert {} from {} superseded by keyed entry", id, signer_name);
                return VerifyOutcome::Superseded { id };
            }
        }

        let entry = AuditEntry::verified(record, Utc::now(), attempts);
        let newly_logged = match self.audit.record(entry).await {
            Ok(write) if write.is_written() => {
                info!(
                    "Verified alert {} from {} after {} attempts",
                    id, signer_name, attempts
                );
                true
            }
            Ok(_) => {
                debug!("Alert {} already in audit log", id);
                false
            }
            Err(e) => {
                warn!("Failed to record alert {} in audit log: {}", id, e);
                false
            }
        };

        VerifyOutcome::Accepted {
            id,
            attempts,
            newly_logged,
        }
    }

    /// Verify notifications from both subscriptions until they end.
    ///
    /// Each notification runs as its own task, at most `max_in_flight` at a
    /// time, so an envelope stuck in retries does not hold up the rest.
    pub async fn run(self: Arc<Self>, mut alerts: Subscription, mut keyed: Subscription) {
        let mut in_flight = JoinSet::new();

        loop {
            let (value, key) = tokio::select! {
                Some(item) = alerts.next() => item,
                Some(item) = keyed.next() => item,
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
                else => break,
            };

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let verifier = self.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                verifier.handle(value, &key).await
            });
        }

        while in_flight.join_next().await.is_some() {}
        debug!("Alert subscriptions closed");
    }

    /// Subscribe to the alert paths and verify in a background task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let alerts = self.store.subscribe(paths::ALERT_COLLECTION);
        let keyed = self.store.subscribe(paths::ALERTS_BY_ID);
        info!(
            "Listening for alerts on {} and {}",
            paths::ALERT_COLLECTION,
            paths::ALERTS_BY_ID
        );
        tokio::spawn(self.run(alerts, keyed))
    }

    async fn keyed_envelope(&self, id: &str) -> Option<SignedEnvelope> {
        match self.store.get(&paths::alert(id)).await {
            Ok(Some(value)) => SignedEnvelope::from_value(value).ok(),
            Ok(None) => None,
            Err(e) => {
                debug!("Keyed read for {} failed: {}", id, e);
                None
            }
        }
    }

    async fn lookup_alias(&self, public_key: &str) -> Option<String> {
        match self.store.get(&paths::user_key(public_key)).await {
            Ok(Some(value)) => value.get("alias").and_then(Value::as_str).map(str::to_string),
            Ok(None) => None,
            Err(e) => {
                debug!("Alias lookup for {} failed: {}", short_key(public_key), e);
                None
            }
        }
    }
}

fn short_key(public_key: &str) -> String {
    public_key.chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AUDIT_LOG_FILE;
    use crate::gossip::NoDialer;
    use crate::storage::LocalGraph;
    use fraudnet_protocol::{AlertDraft, Ed25519Signer, KeyPair, ProtocolError};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Reports "not yet verifiable" for the first `failures` calls.
    struct FlakySigner {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakySigner {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl SigningPrimitive for FlakySigner {
        fn generate_keypair(&self) -> KeyPair {
            Ed25519Signer.generate_keypair()
        }

        fn sign(&self, payload: &Value, keypair: &KeyPair) -> Result<SignedEnvelope, ProtocolError> {
            Ed25519Signer.sign(payload, keypair)
        }

        fn verify(
            &self,
            envelope: &SignedEnvelope,
            public_key: &str,
        ) -> Result<Option<Value>, ProtocolError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Ok(None);
            }
            Ed25519Signer.verify(envelope, public_key)
        }
    }

    struct Fixture {
        _dir: TempDir,
        graph: LocalGraph,
        audit: Arc<AuditLog>,
        verifier: Verifier,
    }

    fn fixture(signer: Arc<dyn SigningPrimitive>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let graph = LocalGraph::temporary(None, Arc::new(NoDialer)).unwrap();
        let audit = Arc::new(AuditLog::new(dir.path().join(AUDIT_LOG_FILE)));
        let config = VerifierConfig {
            settle_delay: Duration::from_millis(1),
            policy: RetryPolicy::fixed(5, Duration::from_millis(1)),
            max_in_flight: 8,
        };
        let verifier = Verifier::new(Arc::new(graph.clone()), signer, audit.clone(), config);
        Fixture {
            _dir: dir,
            graph,
            audit,
            verifier,
        }
    }

    fn signed_alert(id: &str) -> Value {
        signed_alert_with_amount(id, 99.0)
    }

    fn signed_alert_with_amount(id: &str, amount: f64) -> Value {
        let keypair = Ed25519Signer.generate_keypair();
        let record = AlertRecord::from_draft(AlertDraft::new(amount, "fraud").with_id(id));
        Ed25519Signer
            .sign(&record.to_value().unwrap(), &keypair)
            .unwrap()
            .with_alias("node_test")
            .to_value()
            .unwrap()
    }

    #[tokio::test]
    async fn test_ignores_irrelevant_notifications() {
        let f = fixture(Arc::new(Ed25519Signer));

        assert_eq!(
            f.verifier.handle(json!("text"), "k").await,
            VerifyOutcome::Ignored(IgnoreReason::NotAnObject)
        );
        assert_eq!(
            f.verifier.handle(signed_alert("fraud-1"), "_meta").await,
            VerifyOutcome::Ignored(IgnoreReason::ReservedKey)
        );
        assert_eq!(
            f.verifier.handle(signed_alert("fraud-1"), "undefined").await,
            VerifyOutcome::Ignored(IgnoreReason::ReservedKey)
        );
        assert_eq!(
            f.verifier.handle(json!({"payload": "{}"}), "k").await,
            VerifyOutcome::Ignored(IgnoreReason::MissingSigner)
        );
        assert_eq!(
            f.verifier.handle(json!({"signerPublicKey": "ab"}), "k").await,
            VerifyOutcome::Ignored(IgnoreReason::Malformed)
        );
        assert!(f.audit.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_valid_alert_is_audited_once() {
        let f = fixture(Arc::new(Ed25519Signer));
        let alert = signed_alert("fraud-1");

        assert_eq!(
            f.verifier.handle(alert.clone(), "k1").await,
            VerifyOutcome::Accepted {
                id: "fraud-1".to_string(),
                attempts: 1,
                newly_logged: true
            }
        );
        assert_eq!(
            f.verifier.handle(alert, "k2").await,
            VerifyOutcome::Accepted {
                id: "fraud-1".to_string(),
                attempts: 1,
                newly_logged: false
            }
        );
        assert_eq!(f.audit.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_late_verification_within_bound_is_accepted() {
        for failures in 0..5 {
            let f = fixture(Arc::new(FlakySigner::new(failures)));
            let outcome = f.verifier.handle(signed_alert("fraud-late"), "k").await;

            assert_eq!(
                outcome,
                VerifyOutcome::Accepted {
                    id: "fraud-late".to_string(),
                    attempts: failures + 1,
                    newly_logged: true
                }
            );
            let entries = f.audit.entries().await.unwrap();
            assert_eq!(entries[0].verification_attempts, failures + 1);
        }
    }

    #[tokio::test]
    async fn test_verification_past_bound_is_dropped() {
        let f = fixture(Arc::new(FlakySigner::new(5)));

        assert_eq!(
            f.verifier.handle(signed_alert("fraud-slow"), "k").await,
            VerifyOutcome::Rejected { attempts: 5 }
        );
        assert!(f.audit.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_tampered_alert_is_dropped() {
        let f = fixture(Arc::new(Ed25519Signer));
        let mut alert = signed_alert("fraud-1");
        alert["payload"] = json!(alert["payload"]
            .as_str()
            .unwrap()
            .replace("99.0", "99999.0"));

        assert_eq!(
            f.verifier.handle(alert, "k").await,
            VerifyOutcome::Rejected { attempts: 5 }
        );
        assert!(!f.audit.contains("fraud-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_spawned_verifier_follows_collection() {
        let f = fixture(Arc::new(Ed25519Signer));
        let Fixture {
            _dir,
            graph,
            audit,
            verifier,
        } = f;

        let task = Arc::new(verifier).spawn();
        graph
            .set(paths::ALERT_COLLECTION, signed_alert("fraud-7"))
            .await
            .unwrap();

        let mut found = false;
        for _ in 0..200 {
            if audit.contains("fraud-7").await.unwrap() {
                found = true;
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        task.abort();
        assert!(found);
    }

    #[tokio::test]
    async fn test_audit_follows_keyed_envelope() {
        let f = fixture(Arc::new(Ed25519Signer));
        let local = signed_alert_with_amount("fraud-1", 1200.0);
        let remote = signed_alert_with_amount("fraud-1", 1350.0);

        f.graph.put(&paths::alert("fraud-1"), local.clone()).await.unwrap();
        assert!(matches!(
            f.verifier.handle(local, "k1").await,
            VerifyOutcome::Accepted { newly_logged: true, .. }
        ));

        // The merge settles on the remote write; the stale envelope no longer commits
        f.graph.put(&paths::alert("fraud-1"), remote.clone()).await.unwrap();
        let stale = signed_alert_with_amount("fraud-1", 1200.0);
        assert_eq!(
            f.verifier.handle(stale, "k2").await,
            VerifyOutcome::Superseded {
                id: "fraud-1".to_string()
            }
        );
        assert!(matches!(
            f.verifier.handle(remote, "fraud-1").await,
            VerifyOutcome::Accepted { newly_logged: true, .. }
        ));

        let entries = f.audit.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.amount, 1350.0);
    }

    #[tokio::test]
    async fn test_forged_alerts_do_not_delay_valid_ones() {
        let dir = TempDir::new().unwrap();
        let graph = LocalGraph::temporary(None, Arc::new(NoDialer)).unwrap();
        let audit = Arc::new(AuditLog::new(dir.path().join(AUDIT_LOG_FILE)));
        let config = VerifierConfig {
            settle_delay: Duration::from_millis(1),
            policy: RetryPolicy::fixed(5, Duration::from_millis(100)),
            max_in_flight: 16,
        };
        let verifier = Arc::new(Verifier::new(
            Arc::new(graph.clone()),
            Arc::new(Ed25519Signer),
            audit.clone(),
            config,
        ));
        let task = verifier.spawn();

        for n in 0..4 {
            let mut forged = signed_alert(&format!("forged-{}", n));
            forged["payload"] = json!(forged["payload"]
                .as_str()
                .unwrap()
                .replace("99.0", "99999.0"));
            graph.set(paths::ALERT_COLLECTION, forged).await.unwrap();
        }
        let queued_at = tokio::time::Instant::now();
        graph
            .set(paths::ALERT_COLLECTION, signed_alert("fraud-valid"))
            .await
            .unwrap();

        let mut audited_after = None;
        for _ in 0..400 {
            if audit.contains("fraud-valid").await.unwrap() {
                audited_after = Some(queued_at.elapsed());
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        task.abort();

        // One forged envelope alone spends 400ms in retries
        let elapsed = audited_after.unwrap();
        assert!(elapsed < Duration::from_millis(350), "audited after {:?}", elapsed);
        assert_eq!(audit.len().await.unwrap(), 1);
    }
}
