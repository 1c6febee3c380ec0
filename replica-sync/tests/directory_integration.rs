//! Integration tests for the directory protocol between in-process peers.
//!
//! Every peer gets its own `Directory` over a `LocalTransport` plugged into
//! one shared `Hub`, so these exercise the full create/announce/reconcile
//! pipeline without sockets.

use std::sync::Arc;

use parking_lot::Mutex;
use replica_sync::directory::{Directory, DirectoryConfig};
use replica_sync::envelope::is_poison_pill;
use replica_sync::hub::{Hub, HubConfig, LocalTransport};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "board";

/// Poll `condition` until it holds or two seconds pass.
async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn peer(hub: &Arc<Hub>) -> (Arc<LocalTransport>, Arc<Directory<LocalTransport>>) {
    let transport = LocalTransport::connect(hub, TOPIC);
    let directory = Directory::new(transport.clone(), DirectoryConfig::default());
    (transport, directory)
}

#[tokio::test]
async fn test_created_value_reaches_other_peer() {
    let hub = Arc::new(Hub::default());
    let (_ta, alice) = peer(&hub);
    let (_tb, bob) = peer(&hub);

    alice.create("piece-1", json!({"row": 0, "col": 4}));

    assert!(wait_until(|| bob.get("piece-1") == Some(json!({"row": 0, "col": 4}))).await);
    assert!(bob.is_bound("piece-1"));
    assert_eq!(bob.directory_ids(), vec!["piece-1".to_string()]);
}

#[tokio::test]
async fn test_updates_flow_both_ways() {
    let hub = Arc::new(Hub::default());
    let (_ta, alice) = peer(&hub);
    let (_tb, bob) = peer(&hub);

    alice.create("score", json!(0));
    assert!(wait_until(|| bob.get("score") == Some(json!(0))).await);

    bob.set("score", json!(5));
    assert!(wait_until(|| alice.get("score") == Some(json!(5))).await);

    alice.set("score", json!(6));
    assert!(wait_until(|| bob.get("score") == Some(json!(6))).await);
    assert_eq!(hub.read(TOPIC, "score"), Some(json!(6)));
}

#[tokio::test]
async fn test_concurrent_creates_all_announced() {
    let hub = Arc::new(Hub::default());
    let (_ta, alice) = peer(&hub);
    let (_tb, bob) = peer(&hub);

    for i in 0..5 {
        alice.create(&format!("a-{i}"), json!(i));
        bob.create(&format!("b-{i}"), json!(i));
    }

    let cancel = CancellationToken::new();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        alice.ensure_all_observable_ids(|s| s.len() == 10, &cancel),
    )
    .await
    .expect("directory never converged")
    .unwrap();

    assert_eq!(snapshot.get("b-3"), Some(&json!(3)));
    assert!(wait_until(|| bob.snapshot().len() == 10).await);
    assert_eq!(alice.snapshot(), bob.snapshot());
}

#[tokio::test]
async fn test_removal_delivers_poison_once() {
    let hub = Arc::new(Hub::default());
    let (_ta, alice) = peer(&hub);
    let (_tb, bob) = peer(&hub);

    alice.create("piece-1", json!(1));
    assert!(wait_until(|| bob.get("piece-1").is_some()).await);

    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    bob.observe("piece-1", move |_, value| s.lock().push(value.clone()));

    alice.remove_observable_for_id("piece-1");

    assert!(wait_until(|| !bob.is_bound("piece-1")).await);
    assert!(wait_until(|| !alice.is_bound("piece-1")).await);
    assert_eq!(bob.get("piece-1"), None);

    let seen = seen.lock();
    assert_eq!(seen.iter().filter(|v| is_poison_pill(v)).count(), 1);
    assert_eq!(seen.last().map(is_poison_pill), Some(true));
}

#[tokio::test]
async fn test_immortal_ids_are_never_torn_down() {
    let hub = Arc::new(Hub::default());
    let (_ta, alice) = peer(&hub);
    let (_tb, bob) = peer(&hub);

    bob.bind("~settings");
    alice.create("~settings", json!({"theme": "dark"}));
    assert!(wait_until(|| bob.get("~settings") == Some(json!({"theme": "dark"}))).await);

    alice.remove_observable_for_id("~settings");
    alice.scheduler().wait_idle().await;
    bob.scheduler().wait_idle().await;

    assert!(bob.is_bound("~settings"));
    assert!(alice.is_bound("~settings"));
}

#[tokio::test]
async fn test_departed_peer_ids_are_reaped() {
    let hub = Arc::new(Hub::new(HubConfig {
        orphan_grace: Some(Duration::from_millis(100)),
        ..HubConfig::default()
    }));
    let (ta, alice) = peer(&hub);
    let (_tb, bob) = peer(&hub);

    alice.create("cursor-alice", json!([3, 4]));
    bob.create("cursor-bob", json!([0, 0]));
    assert!(wait_until(|| bob.is_bound("cursor-alice") && alice.is_bound("cursor-bob")).await);
    alice.scheduler().wait_idle().await;

    drop(alice);
    drop(ta);

    assert!(wait_until(|| !bob.is_bound("cursor-alice")).await);
    assert!(bob.is_bound("cursor-bob"));
    assert_eq!(hub.read(TOPIC, "cursor-alice"), None);
    assert_eq!(bob.directory_ids(), vec!["cursor-bob".to_string()]);
    assert_eq!(hub.stats().ids_reaped, 1);
}

#[tokio::test]
async fn test_resync_after_reconnect() {
    let hub = Arc::new(Hub::default());
    let (_ta, alice) = peer(&hub);
    let (tb, bob) = peer(&hub);

    let cancel = CancellationToken::new();
    let events = tb.take_event_rx().unwrap();
    let resync = bob.resync_on_reconnect(events, cancel.clone());

    alice.create("piece-1", json!("a"));
    assert!(wait_until(|| bob.get("piece-1") == Some(json!("a"))).await);

    tb.set_online(false);
    alice.set("piece-1", json!("b"));
    alice.create("piece-2", json!("c"));
    alice.scheduler().wait_idle().await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.get("piece-1"), Some(json!("a")));
    assert!(!bob.is_bound("piece-2"));

    tb.set_online(true);
    assert!(wait_until(|| bob.get("piece-2") == Some(json!("c"))).await);
    assert!(wait_until(|| bob.get("piece-1") == Some(json!("b"))).await);

    cancel.cancel();
    resync.await.unwrap();
}
