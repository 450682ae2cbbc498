//! End-to-end scenarios driven directly against the hub actor, bypassing
//! the websocket transport. Each test mirrors one literal scenario: two
//! or more participants joining a session and exchanging frames over
//! their own unbounded channels, exactly as `connection::handle_socket`
//! would see them.

use std::sync::Arc;
use std::time::Duration;

use paramsync_core::{ParamName, ParamUpdate, User};
use paramsync_server::hub::HubRegistry;
use paramsync_server::store::NullStore;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn user(id: &str, name: &str) -> User {
    User {
        id: id.to_string(),
        name: name.to_string(),
        color: None,
        avatar: None,
    }
}

async fn registry() -> Arc<HubRegistry> {
    Arc::new(HubRegistry::new(Arc::new(NullStore)))
}

const SHORT: Duration = Duration::from_millis(50);

#[tokio::test]
async fn basic_broadcast_reaches_everyone_but_the_proposer() {
    let registry = registry().await;
    let hub = registry.get_or_create("s1").await;

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let conn_a = hub.join(tx_a).await.unwrap();
    hub.authenticate(conn_a, user("a", "Alice")).await.unwrap();

    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let conn_b = hub.join(tx_b).await.unwrap();
    hub.authenticate(conn_b, user("b", "Bob")).await.unwrap();

    // Alice sees Bob's join broadcast before anything else happens.
    let joined = rx_a.recv().await.unwrap();
    assert_eq!(joined["type"], "session:joined");

    hub.propose_update(
        conn_a,
        ParamUpdate {
            mu: Some(0.60),
            ..Default::default()
        },
    );

    let frame = rx_b.recv().await.unwrap();
    assert_eq!(frame["type"], "param:broadcast");
    assert_eq!(frame["seq"], 1);
    assert_eq!(frame["payload"]["userId"], "a");
    assert_eq!(frame["payload"]["params"]["mu"], 0.60);

    // Alice proposed it; she gets nothing back.
    assert!(timeout(SHORT, rx_a.recv()).await.is_err());

    let snapshot = hub.snapshot().await.unwrap();
    assert_eq!(snapshot.seq, 1);
    assert!((snapshot.state.mu - 0.60).abs() < 1e-9);
    assert!((snapshot.state.beta - 0.17644).abs() < 1e-9);
}

#[tokio::test]
async fn conflicting_proposal_is_rejected_and_reported_only_to_proposer() {
    let registry = registry().await;
    let hub = registry.get_or_create("s2").await;

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let conn_a = hub.join(tx_a).await.unwrap();
    hub.authenticate(conn_a, user("a", "Alice")).await.unwrap();

    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let conn_b = hub.join(tx_b).await.unwrap();
    hub.authenticate(conn_b, user("b", "Bob")).await.unwrap();
    let _ = rx_a.recv().await.unwrap(); // Bob's session:joined

    hub.propose_update(
        conn_a,
        ParamUpdate {
            omega: Some(1.20),
            ..Default::default()
        },
    );
    let first = rx_b.recv().await.unwrap();
    assert_eq!(first["type"], "param:broadcast");
    assert_eq!(first["seq"], 1);

    tokio::time::sleep(Duration::from_millis(100)).await;

    hub.propose_update(
        conn_b,
        ParamUpdate {
            omega: Some(0.90),
            ..Default::default()
        },
    );

    let conflict = rx_b.recv().await.unwrap();
    assert_eq!(conflict["type"], "conflict:detected");
    assert_eq!(conflict["payload"]["param"], "omega");
    assert_eq!(conflict["payload"]["yourValue"], 0.90);
    assert_eq!(conflict["payload"]["theirValue"], 1.20);
    assert_eq!(conflict["payload"]["theirUserId"], "a");

    // No one else was told, and the hub's state/seq did not move.
    assert!(timeout(SHORT, rx_a.recv()).await.is_err());
    let snapshot = hub.snapshot().await.unwrap();
    assert_eq!(snapshot.seq, 1);
    assert!((snapshot.state.omega - 1.20).abs() < 1e-9);
}

#[tokio::test]
async fn resolving_a_conflict_applies_and_broadcasts_unconditionally() {
    let registry = registry().await;
    let hub = registry.get_or_create("s3").await;

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let conn_a = hub.join(tx_a).await.unwrap();
    hub.authenticate(conn_a, user("a", "Alice")).await.unwrap();

    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let conn_b = hub.join(tx_b).await.unwrap();
    hub.authenticate(conn_b, user("b", "Bob")).await.unwrap();
    let _ = rx_a.recv().await.unwrap();

    hub.propose_update(
        conn_a,
        ParamUpdate {
            omega: Some(1.20),
            ..Default::default()
        },
    );
    let _ = rx_b.recv().await.unwrap();

    hub.resolve_conflict(conn_b, ParamName::Omega, 1.05);

    let resolved = rx_a.recv().await.unwrap();
    assert_eq!(resolved["type"], "param:broadcast");
    assert_eq!(resolved["seq"], 2);
    assert_eq!(resolved["payload"]["params"]["omega"], 1.05);

    assert!(timeout(SHORT, rx_b.recv()).await.is_err());

    let snapshot = hub.snapshot().await.unwrap();
    assert_eq!(snapshot.seq, 2);
    assert!((snapshot.state.omega - 1.05).abs() < 1e-9);
}

#[tokio::test]
async fn resync_never_bumps_seq_and_reflects_current_state() {
    let registry = registry().await;
    let hub = registry.get_or_create("s4").await;

    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let conn_a = hub.join(tx_a).await.unwrap();
    hub.authenticate(conn_a, user("a", "Alice")).await.unwrap();

    hub.propose_update(
        conn_a,
        ParamUpdate {
            mu: Some(0.60),
            ..Default::default()
        },
    );
    // Proposals from the lone participant have no one else to broadcast
    // to; give the actor a moment to drain the mailbox before asserting.
    tokio::time::sleep(SHORT).await;

    let before = hub.snapshot().await.unwrap();
    let state_payload = hub.resync().await.unwrap();
    let after = hub.snapshot().await.unwrap();

    assert_eq!(state_payload.seq, before.seq);
    assert_eq!(before.seq, after.seq, "resync must not bump seq");
    assert!((state_payload.params.mu - 0.60).abs() < 1e-9);
}

#[tokio::test]
async fn out_of_bounds_proposal_is_silently_dropped() {
    let registry = registry().await;
    let hub = registry.get_or_create("s5").await;

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let conn_a = hub.join(tx_a).await.unwrap();
    hub.authenticate(conn_a, user("a", "Alice")).await.unwrap();

    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let conn_b = hub.join(tx_b).await.unwrap();
    hub.authenticate(conn_b, user("b", "Bob")).await.unwrap();
    let _ = rx_a.recv().await.unwrap();

    let before = hub.snapshot().await.unwrap();

    hub.propose_update(
        conn_a,
        ParamUpdate {
            mu: Some(0.80), // outside 0.500..=0.700
            ..Default::default()
        },
    );

    assert!(timeout(SHORT, rx_b.recv()).await.is_err());
    let after = hub.snapshot().await.unwrap();
    assert_eq!(before.state, after.state);
    assert_eq!(before.seq, after.seq);
}

#[tokio::test]
async fn presence_churn_and_teardown_on_last_leave() {
    let registry = registry().await;
    let hub = registry.get_or_create("s6").await;

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let conn_a = hub.join(tx_a).await.unwrap();
    hub.authenticate(conn_a, user("a", "Alice")).await.unwrap();

    let (tx_b, _rx_b) = mpsc::unbounded_channel();
    let conn_b = hub.join(tx_b).await.unwrap();
    hub.authenticate(conn_b, user("b", "Bob")).await.unwrap();

    let joined = rx_a.recv().await.unwrap();
    assert_eq!(joined["type"], "session:joined");
    assert_eq!(joined["payload"]["user"]["id"], "b");

    hub.leave(conn_b);
    let left = rx_a.recv().await.unwrap();
    assert_eq!(left["type"], "session:left");
    assert_eq!(left["payload"]["userId"], "b");

    hub.leave(conn_a);

    // Give the actor a moment to observe the empty roster and exit.
    tokio::time::sleep(SHORT).await;
    assert!(hub.snapshot().await.is_none(), "hub should have torn itself down");

    // A fresh join rehydrates a brand new Active hub for the same id,
    // starting from seq 0 since `NullStore` retained nothing.
    let reopened = registry.get_or_create("s6").await;
    let snapshot = reopened.snapshot().await.unwrap();
    assert_eq!(snapshot.seq, 0);
    assert!(snapshot.users.is_empty());
}
