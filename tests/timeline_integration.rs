//! Cross-component scenarios spanning the change channel, diff engine and
//! timeline store (S1-S3), exercised without a live cluster by constructing
//! `ChangeEvent`s directly the way the connection controller's dispatcher
//! would after draining the change channel.

use chrono::{Duration, Utc};
use serde_json::json;

use kordon_core::k8s::change::{CacheOrigin, ChangeEvent, ChangeKind};
use kordon_core::k8s::diff::diff_snapshots;
use kordon_core::k8s::timeline::{EventType, QueryOptions, TimelineStore};
use kordon_core::k8s::{ResourceRef, ResourceSnapshot};

fn snapshot(uid: &str, name: &str, data: serde_json::Value, created_at: chrono::DateTime<Utc>) -> ResourceSnapshot {
    ResourceSnapshot {
        kind: "Deployment".to_string(),
        namespace: Some("d1".to_string()),
        name: name.to_string(),
        uid: uid.to_string(),
        resource_version: Some("1".to_string()),
        creation_timestamp: Some(created_at),
        labels: Default::default(),
        owner: None,
        data,
    }
}

fn added(snapshot: ResourceSnapshot, observed_at: chrono::DateTime<Utc>) -> ChangeEvent {
    ChangeEvent {
        change: ChangeKind::Added,
        origin: CacheOrigin::Typed,
        resource: snapshot.resource_ref(),
        snapshot,
        diff: None,
        observed_at,
    }
}

/// S1: create a Deployment, see one `created` plus an `Available` historical
/// event, then scale it and see one `updated` whose diff summary reads
/// "replicas 3→5".
#[tokio::test]
async fn deployment_create_then_scale_produces_expected_timeline() {
    let store = TimelineStore::new(100, Duration::seconds(30).to_std().unwrap());
    let now = Utc::now();

    let created_data = json!({
        "spec": { "replicas": 3 },
        "status": {
            "readyReplicas": 3,
            "conditions": [
                { "type": "Available", "status": "True", "lastTransitionTime": now.to_rfc3339() }
            ]
        }
    });
    let initial = snapshot("uid-1", "web", created_data.clone(), now);
    let appended = store.record_change(&added(initial.clone(), now)).await;

    assert!(appended.iter().any(|e| e.event_type == EventType::Created));
    assert!(appended
        .iter()
        .any(|e| e.event_type == EventType::Historical && e.message.as_deref() == Some("Available=True")));

    let scaled_data = json!({
        "spec": { "replicas": 5 },
        "status": {
            "readyReplicas": 3,
            "conditions": [
                { "type": "Available", "status": "True", "lastTransitionTime": now.to_rfc3339() }
            ]
        }
    });
    let diff = diff_snapshots(&created_data, &scaled_data);
    assert_eq!(diff.summary, "replicas 3→5");

    let scaled = snapshot("uid-1", "web", scaled_data, now);
    let update_event = ChangeEvent {
        change: ChangeKind::Modified,
        origin: CacheOrigin::Typed,
        resource: scaled.resource_ref(),
        snapshot: scaled,
        diff: Some(diff),
        observed_at: now + Duration::seconds(1),
    };
    let updated = store.record_change(&update_event).await;
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].event_type, EventType::Updated);
    assert_eq!(updated[0].message.as_deref(), Some("replicas 3→5"));

    let events = store.query(&QueryOptions::new()).await;
    assert!(events.len() >= 2);
}

/// S2: delete then recreate under the same name with a fresh uid yields a
/// fresh `created` event rather than being suppressed as already-seen.
#[tokio::test]
async fn delete_then_recreate_is_not_suppressed() {
    let store = TimelineStore::new(100, Duration::seconds(30).to_std().unwrap());
    let now = Utc::now();

    let first = snapshot("uid-1", "x", json!({}), now);
    store.record_change(&added(first.clone(), now)).await;

    let delete_event = ChangeEvent {
        change: ChangeKind::Deleted,
        origin: CacheOrigin::Typed,
        resource: first.resource_ref(),
        snapshot: first,
        diff: None,
        observed_at: now + Duration::seconds(1),
    };
    let deleted = store.record_change(&delete_event).await;
    assert_eq!(deleted[0].event_type, EventType::Deleted);

    let second = snapshot("uid-2", "x", json!({}), now + Duration::seconds(2));
    let recreated = store.record_change(&added(second, now + Duration::seconds(2))).await;
    assert!(recreated.iter().any(|e| e.event_type == EventType::Created));
}

/// S3: with a store capacity of 100, appending 150 synthetic events leaves
/// exactly the last 100 in append order, and a `limit=200` query still
/// returns only the 100 that survived.
#[tokio::test]
async fn fifo_eviction_bounds_query_results() {
    let store = TimelineStore::new(100, Duration::seconds(30).to_std().unwrap());
    let base = Utc::now() - Duration::seconds(1000);

    for i in 0..150 {
        let observed_at = base + Duration::seconds(i);
        let resource = snapshot(&format!("uid-{i}"), &format!("obj-{i}"), json!({}), observed_at);
        let resource_ref = ResourceRef {
            kind: resource.kind.clone(),
            namespace: resource.namespace.clone(),
            name: resource.name.clone(),
            uid: resource.uid.clone(),
        };
        let event = ChangeEvent {
            change: ChangeKind::Added,
            origin: CacheOrigin::Typed,
            resource: resource_ref,
            snapshot: resource,
            diff: None,
            observed_at,
        };
        store.record_change(&event).await;
    }

    let mut options = QueryOptions::new();
    options.limit = 200;
    let events = store.query(&options).await;
    assert_eq!(events.len(), 100);

    let earliest = events.first().expect("non-empty");
    let expected_earliest = base + Duration::seconds(50);
    assert_eq!(earliest.timestamp, expected_earliest);
}
