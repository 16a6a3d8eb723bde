//! Broadcaster (C8, §4.8): fans change notifications and new timeline
//! events out to per-subscriber bounded buffers. A slow subscriber is
//! dropped silently from its own perspective — sends are always
//! non-blocking, and a full per-subscriber buffer only increments that
//! subscriber's drop counter (§4.8, §5, P9) — it never backs up the pump
//! loop or the other subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use super::change::ChangeEvent;
use super::connection::ConnectionStatus;
use super::timeline::TimelineEvent;

/// One message delivered on a subscriber's stream (§6 "Subscription API").
/// Tagged so the HTTP/SSE boundary can serialize it directly as the `data:`
/// payload; clients are required to tolerate unknown tags, so adding a
/// variant here is not a breaking wire change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriberMessage {
    ChangeEvent(ChangeEvent),
    TimelineEvent(TimelineEvent),
    ConnectionStatus(ConnectionStatus),
    TopologySnapshot(Value),
}

struct Subscriber {
    sender: mpsc::Sender<SubscriberMessage>,
    drops: AtomicU64,
}

/// Handle returned to a caller that subscribed; dropping it (or calling
/// `close`) tears down just that one subscription.
pub struct Subscription {
    id: u64,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn close(self) {
        self.broadcaster.unsubscribe(self.id).await;
    }
}

pub struct Broadcaster {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    buffer_capacity: usize,
    topology_snapshot: RwLock<Option<Value>>,
}

impl Broadcaster {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_capacity: buffer_capacity.max(1),
            topology_snapshot: RwLock::new(None),
        }
    }

    /// Registers a new subscriber and hands back its receiver plus a handle
    /// that can close it. The cached topology snapshot, if any, is sent
    /// immediately (§4.8 "serve it to new subscribers on attach").
    pub async fn subscribe(self: &Arc<Self>) -> (mpsc::Receiver<SubscriberMessage>, Subscription) {
        let (sender, receiver) = mpsc::channel(self.buffer_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Some(snapshot) = self.topology_snapshot.read().await.clone() {
            let _ = sender.try_send(SubscriberMessage::TopologySnapshot(snapshot));
        }

        self.subscribers.write().await.insert(
            id,
            Subscriber {
                sender,
                drops: AtomicU64::new(0),
            },
        );

        (
            receiver,
            Subscription {
                id,
                broadcaster: self.clone(),
            },
        )
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.remove(&id);
    }

    async fn fan_out(&self, message: SubscriberMessage) {
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.values() {
            if subscriber.sender.try_send(message.clone()).is_err() {
                subscriber.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub async fn publish_change(&self, event: ChangeEvent) {
        self.fan_out(SubscriberMessage::ChangeEvent(event)).await;
    }

    pub async fn publish_timeline(&self, event: TimelineEvent) {
        self.fan_out(SubscriberMessage::TimelineEvent(event)).await;
    }

    pub async fn publish_status(&self, status: ConnectionStatus) {
        self.fan_out(SubscriberMessage::ConnectionStatus(status)).await;
    }

    /// Replaces the cached topology snapshot and fans it out to current
    /// subscribers; future `subscribe` calls also receive this value on
    /// attach until it is replaced again (§4.8).
    pub async fn set_topology_snapshot(&self, snapshot: Value) {
        *self.topology_snapshot.write().await = Some(snapshot.clone());
        self.fan_out(SubscriberMessage::TopologySnapshot(snapshot)).await;
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn drop_counts(&self) -> HashMap<u64, u64> {
        self.subscribers
            .read()
            .await
            .iter()
            .map(|(id, sub)| (*id, sub.drops.load(Ordering::Relaxed)))
            .collect()
    }

    /// Closes every subscriber channel (§4.8 "on teardown"), used by C9
    /// during context switch and shutdown.
    pub async fn teardown(&self) {
        self.subscribers.write().await.clear();
        *self.topology_snapshot.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::change::{CacheOrigin, ChangeKind};
    use crate::k8s::snapshot::ResourceSnapshot;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sample_change() -> ChangeEvent {
        let snapshot = ResourceSnapshot {
            kind: "Pod".to_string(),
            namespace: Some("default".to_string()),
            name: "web-1".to_string(),
            uid: "u1".to_string(),
            resource_version: None,
            creation_timestamp: None,
            labels: BTreeMap::new(),
            owner: None,
            data: json!({}),
        };
        ChangeEvent {
            change: ChangeKind::Added,
            origin: CacheOrigin::Typed,
            resource: snapshot.resource_ref(),
            snapshot,
            diff: None,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_change() {
        let broadcaster = Arc::new(Broadcaster::new(4));
        let (mut receiver, _subscription) = broadcaster.subscribe().await;
        broadcaster.publish_change(sample_change()).await;
        let message = receiver.recv().await.unwrap();
        assert!(matches!(message, SubscriberMessage::ChangeEvent(_)));
    }

    #[tokio::test]
    async fn full_subscriber_buffer_drops_without_blocking_others() {
        let broadcaster = Arc::new(Broadcaster::new(1));
        let (_slow_receiver, _slow_sub) = broadcaster.subscribe().await;
        let (mut fast_receiver, _fast_sub) = broadcaster.subscribe().await;

        broadcaster.publish_change(sample_change()).await;
        broadcaster.publish_change(sample_change()).await;

        assert!(fast_receiver.recv().await.is_some());
        let drops = broadcaster.drop_counts().await;
        assert!(drops.values().any(|&count| count >= 1));
    }

    #[tokio::test]
    async fn new_subscriber_receives_cached_topology_snapshot() {
        let broadcaster = Arc::new(Broadcaster::new(4));
        broadcaster.set_topology_snapshot(json!({"nodes": []})).await;
        let (mut receiver, _subscription) = broadcaster.subscribe().await;
        let message = receiver.recv().await.unwrap();
        assert!(matches!(message, SubscriberMessage::TopologySnapshot(_)));
    }

    #[tokio::test]
    async fn teardown_closes_all_subscriber_channels() {
        let broadcaster = Arc::new(Broadcaster::new(4));
        let (mut receiver, _subscription) = broadcaster.subscribe().await;
        broadcaster.teardown().await;
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_fan_out() {
        let broadcaster = Arc::new(Broadcaster::new(4));
        let (_receiver, subscription) = broadcaster.subscribe().await;
        assert_eq!(broadcaster.subscriber_count().await, 1);
        subscription.close().await;
        assert_eq!(broadcaster.subscriber_count().await, 0);
    }
}
