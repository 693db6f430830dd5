//! Lease invariants of the in-process store under concurrent access.

use std::sync::Arc;
use std::time::Duration;

use leaseq::model::{LeaseState, PayloadKey};
use leaseq::store::{CompletionTime, DocumentStore, MemoryStore};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_lease_each_item_once() {
    let store = Arc::new(MemoryStore::new());
    for n in 0..5 {
        store.insert("t", &json!({"n": n})).await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move { store.claim("t").await.unwrap() }));
    }

    let mut claimed = Vec::new();
    for task in tasks {
        if let Some(item) = task.await.unwrap() {
            claimed.push(item.id);
        }
    }
    claimed.sort_by_key(|id| id.0);
    claimed.dedup();
    assert_eq!(claimed.len(), 5);
    assert!(store.claim("t").await.unwrap().is_none());
}

#[tokio::test]
async fn detached_handle_sees_the_same_items() {
    let store = MemoryStore::new();
    let item = store.insert("t", &json!({"x": 1})).await.unwrap();
    let detached = store.detach().await.unwrap();

    let claimed = detached.claim("t").await.unwrap().unwrap();
    assert_eq!(claimed.id, item.id);
    let seen = store.get("t", item.id).await.unwrap().unwrap();
    assert_eq!(seen.state(), LeaseState::Leased);
}

#[tokio::test]
async fn completion_is_terminal() {
    let store = MemoryStore::new();
    store.insert("t", &json!({"x": 1})).await.unwrap();
    let item = store.claim("t").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(
        store
            .complete("t", item.id, CompletionTime::SinceLeaseStart)
            .await
            .unwrap()
    );
    let done = store.get("t", item.id).await.unwrap().unwrap();
    assert_eq!(done.state(), LeaseState::Completed);
    assert!(done.work_seconds >= 0.02);

    assert!(!store.refresh_heartbeat("t", item.id).await.unwrap());
    assert!(!store.release("t", item.id).await.unwrap());
    assert!(
        !store
            .complete("t", item.id, CompletionTime::Fixed(1.0))
            .await
            .unwrap()
    );
    assert!(
        !store
            .reclaim("t", item.id, Duration::ZERO, 1.0)
            .await
            .unwrap()
    );
    assert!(store.claim("t").await.unwrap().is_none());
    assert_eq!(store.get("t", item.id).await.unwrap().unwrap(), done);
}

#[tokio::test]
async fn reclaim_rechecks_staleness() {
    let store = MemoryStore::new();
    store.insert("t", &json!({"x": 1})).await.unwrap();
    let item = store.claim("t").await.unwrap().unwrap();
    let grace = Duration::from_millis(40);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let stale = store.find_stale("t", grace).await.unwrap();
    assert_eq!(stale.len(), 1);

    // The holder refreshes between the scan and the write.
    assert!(store.refresh_heartbeat("t", item.id).await.unwrap());
    assert!(!store.reclaim("t", item.id, grace, 0.06).await.unwrap());
    assert_eq!(
        store.get("t", item.id).await.unwrap().unwrap().state(),
        LeaseState::Leased
    );
}

#[tokio::test]
async fn reclaim_accumulates_work_seconds() {
    let store = MemoryStore::new();
    store.insert("t", &json!({"x": 1})).await.unwrap();

    for elapsed in [0.5, 0.25] {
        let item = store.claim("t").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(
            store
                .reclaim("t", item.id, Duration::ZERO, elapsed)
                .await
                .unwrap()
        );
    }

    let item = store.claim("t").await.unwrap().unwrap();
    assert_eq!(item.work_seconds, 0.75);
    assert!(item.lease_end.is_none());
}

#[tokio::test]
async fn payload_lookup_matches_numbers_by_value() {
    let store = MemoryStore::new();
    let item = store
        .insert("t", &json!({"id": 1.0, "state": {"epoch": 2}}))
        .await
        .unwrap();

    let id = PayloadKey::parse("id").unwrap();
    let found = store.find_by_payload("t", &id, &json!(1)).await.unwrap();
    assert_eq!(found.map(|found| found.id), Some(item.id));

    let epoch = PayloadKey::parse("state.epoch").unwrap();
    assert!(store.find_by_payload("t", &epoch, &json!(2)).await.unwrap().is_some());
    assert!(store.find_by_payload("t", &epoch, &json!("2")).await.unwrap().is_none());
    assert!(store.find_by_payload("u", &id, &json!(1)).await.unwrap().is_none());
}
