//! Alert propagation between nodes linked through an in-process mesh.

use fraudnet_federation::{FraudNode, GraphStore, Mesh, NodeConfig};
use fraudnet_protocol::{
    paths, AlertDraft, AlertRecord, Ed25519Signer, SignedEnvelope, SigningPrimitive,
};
use std::time::Duration;
use tempfile::TempDir;

struct TestNode {
    _dir: TempDir,
    node: FraudNode,
}

fn node(mesh: &Mesh, name: &str, peers: &[&str]) -> TestNode {
    let dir = TempDir::new().unwrap();
    let mut config = NodeConfig::with_data_dir(dir.path());
    config.local_ip = Some("127.0.0.1".parse().unwrap());
    config.peers = peers.iter().map(|peer| peer.to_string()).collect();
    config.publisher.reconnect_wait = Duration::from_millis(10);
    config.publisher.read_back_delay = Duration::from_millis(10);
    config.verifier.settle_delay = Duration::from_millis(5);
    config.verifier.policy.delay = Duration::from_millis(5);

    let graph = mesh.graph(name).unwrap();
    TestNode {
        _dir: dir,
        node: FraudNode::with_graph(config, graph),
    }
}

async fn audited(node: &FraudNode, id: &str) -> bool {
    for _ in 0..400 {
        if node.audit().contains(id).await.unwrap() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

async fn count(node: &FraudNode, id: &str) -> usize {
    node.audit()
        .entries()
        .await
        .unwrap()
        .iter()
        .filter(|entry| entry.id() == id)
        .count()
}

#[tokio::test]
async fn test_two_publishers_same_id_audit_once() {
    let mesh = Mesh::new();
    let a = node(&mesh, "mesh://a", &["mesh://b"]);
    let b = node(&mesh, "mesh://b", &["mesh://a"]);

    a.node.start().await.unwrap();
    b.node.start().await.unwrap();

    let from_a = AlertDraft::new(1200.0, "card-testing")
        .with_id("fraud-1")
        .with_field("nodeId", "node-alpha");
    let from_b = AlertDraft::new(1350.0, "card-testing")
        .with_id("fraud-1")
        .with_field("nodeId", "node-beta");
    assert_eq!(a.node.publish(from_a).await.unwrap(), "fraud-1");
    assert_eq!(b.node.publish(from_b).await.unwrap(), "fraud-1");

    assert!(audited(&a.node, "fraud-1").await);
    assert!(audited(&b.node, "fraud-1").await);

    // Both replicas settle on one keyed envelope
    let mut winner = None;
    for _ in 0..200 {
        let keyed_a = a.node.graph().get(&paths::alert("fraud-1")).await.unwrap();
        let keyed_b = b.node.graph().get(&paths::alert("fraud-1")).await.unwrap();
        if keyed_a.is_some() && keyed_a == keyed_b {
            winner = keyed_a;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let winner = winner.expect("keyed envelopes did not converge");
    let envelope = SignedEnvelope::from_value(winner).unwrap();
    let payload = Ed25519Signer
        .verify(&envelope, &envelope.signer_public_key)
        .unwrap()
        .unwrap();
    let settled_amount = AlertRecord::from_value(payload).unwrap().amount;

    // Each audit log holds exactly that payload
    for node in [&a.node, &b.node] {
        let mut amount = None;
        for _ in 0..400 {
            let entries = node.audit().entries().await.unwrap();
            amount = entries.iter().find(|e| e.id() == "fraud-1").map(|e| e.record.amount);
            if amount == Some(settled_amount) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(amount, Some(settled_amount));
        assert_eq!(count(node, "fraud-1").await, 1);
    }

    a.node.shutdown().await;
    b.node.shutdown().await;
}

#[tokio::test]
async fn test_publish_without_peers() {
    let mesh = Mesh::new();
    let lonely = node(&mesh, "mesh://lonely", &[]);
    lonely.node.start().await.unwrap();
    assert!(lonely.node.peers().is_empty().await);

    let id = lonely
        .node
        .publish(AlertDraft::new(75.0, "fraud"))
        .await
        .unwrap();
    assert!(id.starts_with("fraud-"));
    assert!(audited(&lonely.node, &id).await);

    lonely.node.shutdown().await;
}

#[tokio::test]
async fn test_offline_publish_reaches_late_peer() {
    let mesh = Mesh::new();
    let a = node(&mesh, "mesh://a", &[]);
    a.node.start().await.unwrap();
    let id = a
        .node
        .publish(AlertDraft::new(310.0, "fraud").with_id("fraud-offline"))
        .await
        .unwrap();

    let b = node(&mesh, "mesh://b", &["mesh://a"]);
    b.node.start().await.unwrap();

    assert!(audited(&b.node, &id).await);

    a.node.shutdown().await;
    b.node.shutdown().await;
}

#[tokio::test]
async fn test_tampered_alert_is_not_audited_by_peer() {
    let mesh = Mesh::new();
    let a = node(&mesh, "mesh://a", &["mesh://b"]);
    let b = node(&mesh, "mesh://b", &["mesh://a"]);
    a.node.start().await.unwrap();
    b.node.start().await.unwrap();

    a.node
        .publish(AlertDraft::new(40.0, "fraud").with_id("fraud-honest"))
        .await
        .unwrap();
    let honest = a
        .node
        .graph()
        .get(&paths::alert("fraud-honest"))
        .await
        .unwrap()
        .unwrap();

    let mut forged = SignedEnvelope::from_value(honest).unwrap();
    forged.payload = forged.payload.replace("fraud-honest", "fraud-forged");
    a.node
        .graph()
        .set(paths::ALERT_COLLECTION, forged.to_value().unwrap())
        .await
        .unwrap();

    assert!(audited(&b.node, "fraud-honest").await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!b.node.audit().contains("fraud-forged").await.unwrap());

    a.node.shutdown().await;
    b.node.shutdown().await;
}
