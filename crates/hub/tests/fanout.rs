#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kuview_core::{cache_key, Event, EventType};
use kuview_hub::{Subscription, SUBSCRIBER_QUEUE_DEPTH};
use serde_json::json;

fn pod(ns: &str, name: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "namespace": ns, "name": name },
    })
}

fn namespace(name: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name },
    })
}

async fn recv(sub: &mut Subscription) -> Arc<Event> {
    tokio::time::timeout(Duration::from_secs(5), sub.rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("queue closed")
}

#[tokio::test]
async fn subscribe_to_empty_cache_then_create() {
    let (emitter, hub) = kuview_hub::spawn(16);
    let (snapshot, mut sub) = hub.snapshot_and_subscribe();
    assert!(snapshot.is_empty());

    emitter.emit(Event::create(pod("default", "p1"))).await;

    let ev = recv(&mut sub).await;
    assert_eq!(ev.event_type, EventType::Create);
    assert_eq!(ev.object["metadata"]["name"], "p1");
    assert_eq!(hub.cache_len(), 1);
}

#[tokio::test]
async fn snapshot_contains_preexisting_keys() {
    let (emitter, hub) = kuview_hub::spawn(16);
    emitter.emit(Event::create(pod("default", "a"))).await;
    emitter.emit(Event::create(pod("default", "b"))).await;

    let (snapshot, _sub) = hub.snapshot_and_subscribe();
    let mut keys: Vec<String> = snapshot.iter().map(|e| e.cache_key()).collect();
    keys.sort();
    assert_eq!(keys, vec!["/v1/Pod/default/a", "/v1/Pod/default/b"]);
    assert!(snapshot.iter().all(|e| e.event_type == EventType::Create));
}

#[tokio::test]
async fn delete_after_subscribe_reaches_subscriber() {
    let (emitter, hub) = kuview_hub::spawn(16);
    let ns1 = namespace("ns1");
    emitter.emit(Event::create(ns1.clone())).await;

    let (snapshot, mut sub) = hub.snapshot_and_subscribe();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].cache_key(), cache_key(&ns1));

    emitter.emit(Event::delete(ns1.clone())).await;
    let ev = recv(&mut sub).await;
    assert_eq!(ev.event_type, EventType::Delete);
    assert_eq!(ev.cache_key(), cache_key(&ns1));
    assert_eq!(hub.cache_len(), 0);
}

#[tokio::test]
async fn subscribe_after_delete_sees_empty_snapshot() {
    let (emitter, hub) = kuview_hub::spawn(16);
    let ns1 = namespace("ns1");
    emitter.emit(Event::create(ns1.clone())).await;
    emitter.emit(Event::delete(ns1)).await;

    let (snapshot, _sub) = hub.snapshot_and_subscribe();
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn create_is_an_upsert() {
    let (emitter, hub) = kuview_hub::spawn(16);
    let (_, mut sub) = hub.snapshot_and_subscribe();

    let mut v1 = pod("default", "p1");
    v1["status"] = json!({"phase": "Pending"});
    let mut v2 = pod("default", "p1");
    v2["status"] = json!({"phase": "Running"});

    emitter.emit(Event::create(v1.clone())).await;
    emitter.emit(Event::create(v1.clone())).await;
    emitter.emit(Event::create(v2.clone())).await;

    assert_eq!(hub.cache_len(), 1);
    assert_eq!(hub.get(&cache_key(&v2)).unwrap()["status"]["phase"], "Running");

    // The subscriber sees the versions in emit order.
    assert_eq!(recv(&mut sub).await.object["status"]["phase"], "Pending");
    assert_eq!(recv(&mut sub).await.object["status"]["phase"], "Pending");
    assert_eq!(recv(&mut sub).await.object["status"]["phase"], "Running");
}

#[tokio::test]
async fn delete_of_missing_key_is_noop_but_still_published() {
    let (emitter, hub) = kuview_hub::spawn(16);
    emitter.emit(Event::create(pod("default", "keep"))).await;
    let (_, mut sub) = hub.snapshot_and_subscribe();

    emitter.emit(Event::delete(pod("default", "never-existed"))).await;

    assert_eq!(hub.cache_len(), 1);
    let ev = recv(&mut sub).await;
    assert_eq!(ev.event_type, EventType::Delete);
    assert_eq!(ev.object["metadata"]["name"], "never-existed");
}

#[tokio::test]
async fn slow_subscriber_is_isolated() {
    let (emitter, hub) = kuview_hub::spawn(64);
    let (_, mut slow) = hub.snapshot_and_subscribe();
    let (_, mut prompt) = hub.snapshot_and_subscribe();

    // The slow subscriber never reads; the prompt one keeps pace by
    // draining between bursts so its queue can never overflow.
    let mut seen = 0usize;
    for burst in 0..20u32 {
        for i in 0..100u32 {
            emitter.emit(Event::create(pod("load", &format!("p{burst}-{i}")))).await;
        }
        while seen < ((burst + 1) * 100) as usize {
            recv(&mut prompt).await;
            seen += 1;
        }
    }
    assert_eq!(seen, 2000);

    // The slow queue filled to its fixed depth; everything past that was
    // dropped for it alone.
    let mut buffered = 0usize;
    while slow.rx.try_recv().is_ok() {
        buffered += 1;
    }
    assert_eq!(buffered, SUBSCRIBER_QUEUE_DEPTH);
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let (_emitter, hub) = kuview_hub::spawn(16);
    let (_, sub) = hub.snapshot_and_subscribe();
    assert_eq!(hub.subscriber_count(), 1);

    let id = sub.id();
    hub.unsubscribe(id);
    hub.unsubscribe(id);
    assert_eq!(hub.subscriber_count(), 0);

    // Drop runs a third remove; still fine.
    drop(sub);
    assert_eq!(hub.subscriber_count(), 0);
}

#[tokio::test]
async fn dropping_subscription_unsubscribes() {
    let (_emitter, hub) = kuview_hub::spawn(16);
    let (_, sub) = hub.snapshot_and_subscribe();
    let (_, sub2) = hub.snapshot_and_subscribe();
    assert_eq!(hub.subscriber_count(), 2);

    drop(sub);
    assert_eq!(hub.subscriber_count(), 1);
    drop(sub2);
    assert_eq!(hub.subscriber_count(), 0);
}

#[tokio::test]
async fn shutdown_closes_every_subscriber_queue() {
    let (emitter, hub) = kuview_hub::spawn(16);
    let (_, mut a) = hub.snapshot_and_subscribe();
    let (_, mut b) = hub.snapshot_and_subscribe();

    emitter.emit(Event::create(pod("default", "p1"))).await;
    drop(emitter);

    // Pending events drain, then the queues close.
    assert!(recv(&mut a).await.event_type == EventType::Create);
    assert!(recv(&mut b).await.event_type == EventType::Create);
    assert!(a.rx.recv().await.is_none());
    assert!(b.rx.recv().await.is_none());
    assert_eq!(hub.subscriber_count(), 0);
}
