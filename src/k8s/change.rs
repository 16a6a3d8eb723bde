//! Change Channel (C5, §4.5): the single bounded queue every cache (typed or
//! dynamic) funnels change notifications through before they reach the
//! timeline store (C7) and the broadcaster (C8). Bounded so a slow or wedged
//! consumer degrades gracefully — dropped events are counted, never
//! propagated as an error to the watch loop that produced them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::errors::DropReason;
use super::diff::Diff;
use super::kind::ALWAYS_NOISY_KINDS;
use super::snapshot::{ResourceRef, ResourceSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// Which cache produced the change — carried through so the timeline store
/// can apply sync-replay suppression only to typed-cache entries where it's
/// meaningful (dynamic/CRD warmup has its own informer-readiness signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOrigin {
    Typed,
    Dynamic,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChangeEvent {
    pub change: ChangeKind,
    pub origin: CacheOrigin,
    pub resource: ResourceRef,
    pub snapshot: ResourceSnapshot,
    pub diff: Option<Diff>,
    pub observed_at: DateTime<Utc>,
}

/// Closed set of `ConfigMap` name substrings excluded from change
/// notifications regardless of content (§4.5 step 3): leader-election and
/// lock configmaps used by cluster add-ons churn on every lease renewal
/// without reflecting anything a human watching the timeline cares about.
const NOISY_CONFIGMAP_PATTERNS: &[&str] = &[
    "-lock",
    "-lease",
    "-leader-election",
    "-heartbeat",
    "cluster-kubestore",
    "cluster-autoscaler-status",
    "datadog-token",
    "datadog-operator-lock",
    "datadog-leader-election",
    "kube-root-ca.certs",
];

fn is_noisy(kind: &str, name: &str) -> bool {
    if ALWAYS_NOISY_KINDS.contains(&kind) {
        return true;
    }
    match kind {
        "ConfigMap" => NOISY_CONFIGMAP_PATTERNS.iter().any(|pattern| name.contains(pattern)),
        "Secret" => name.ends_with("-token") || name.contains("leader-election"),
        _ => false,
    }
}

#[derive(Default)]
struct DropCounters {
    channel_full: AtomicU64,
    noisy_filter: AtomicU64,
}

impl DropCounters {
    fn record(&self, reason: DropReason) {
        match reason {
            DropReason::ChannelFull => self.channel_full.fetch_add(1, Ordering::Relaxed),
            DropReason::NoisyFilter => self.noisy_filter.fetch_add(1, Ordering::Relaxed),
            DropReason::AlreadySeen | DropReason::StoreFailed => 0,
        };
    }

    fn snapshot(&self) -> HashMap<DropReason, u64> {
        let mut map = HashMap::new();
        map.insert(DropReason::ChannelFull, self.channel_full.load(Ordering::Relaxed));
        map.insert(DropReason::NoisyFilter, self.noisy_filter.load(Ordering::Relaxed));
        map
    }
}

/// The producer half held by caches; cheap to clone, shares the bounded
/// sender and the drop counters.
#[derive(Clone)]
pub struct ChangeChannel {
    sender: mpsc::Sender<ChangeEvent>,
    counters: Arc<DropCounters>,
}

impl ChangeChannel {
    /// Creates the channel at the configured capacity (§4.5: ~10,000) and
    /// returns the receiver half for the connection controller's dispatcher
    /// loop to drain.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChangeEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                counters: Arc::new(DropCounters::default()),
            },
            receiver,
        )
    }

    /// Applies the noise filter and attempts a non-blocking send. Returns
    /// the drop reason when the event was suppressed, so callers can trace
    /// at debug level without the channel itself needing a logger. The
    /// filter only applies to `update` operations (§4.5 step 3) — an add or
    /// delete of a noisy kind still needs to flow through so `seen`-set
    /// bookkeeping in the timeline store stays correct.
    pub fn enqueue(&self, event: ChangeEvent) -> Result<(), DropReason> {
        if event.change == ChangeKind::Modified && is_noisy(&event.resource.kind, &event.resource.name) {
            self.counters.record(DropReason::NoisyFilter);
            return Err(DropReason::NoisyFilter);
        }

        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.record(DropReason::ChannelFull);
                Err(DropReason::ChannelFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.record(DropReason::ChannelFull);
                Err(DropReason::ChannelFull)
            }
        }
    }

    pub fn drop_counters(&self) -> HashMap<DropReason, u64> {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(kind: &str, name: &str) -> ChangeEvent {
        let resource = ResourceRef {
            kind: kind.to_string(),
            namespace: Some("default".to_string()),
            name: name.to_string(),
            uid: "u1".to_string(),
        };
        ChangeEvent {
            change: ChangeKind::Modified,
            origin: CacheOrigin::Typed,
            resource: resource.clone(),
            snapshot: ResourceSnapshot {
                kind: resource.kind,
                namespace: resource.namespace,
                name: resource.name,
                uid: resource.uid,
                resource_version: None,
                creation_timestamp: None,
                labels: Default::default(),
                owner: None,
                data: json!({}),
            },
            diff: None,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn always_noisy_kinds_are_dropped() {
        assert!(is_noisy("Lease", "any"));
        assert!(is_noisy("EndpointSlice", "any"));
    }

    #[test]
    fn noisy_configmap_name_is_dropped_others_are_not() {
        assert!(is_noisy("ConfigMap", "cluster-autoscaler-status"));
        assert!(is_noisy("ConfigMap", "myapp-leader-election"));
        assert!(is_noisy("ConfigMap", "datadog-operator-lock"));
        assert!(!is_noisy("ConfigMap", "my-app-config"));
    }

    #[test]
    fn noisy_secret_name_patterns_are_dropped() {
        assert!(is_noisy("Secret", "default-token"));
        assert!(is_noisy("Secret", "myapp-leader-election-lock"));
        assert!(!is_noisy("Secret", "my-tls-cert"));
    }

    #[tokio::test]
    async fn enqueue_delivers_non_noisy_events() {
        let (channel, mut receiver) = ChangeChannel::new(4);
        channel.enqueue(sample_event("Pod", "web-1")).unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.resource.name, "web-1");
    }

    #[tokio::test]
    async fn enqueue_drops_noisy_events_without_filling_channel() {
        let (channel, mut receiver) = ChangeChannel::new(4);
        let result = channel.enqueue(sample_event("Lease", "my-lock"));
        assert_eq!(result, Err(DropReason::NoisyFilter));
        assert_eq!(channel.drop_counters()[&DropReason::NoisyFilter], 1);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn enqueue_counts_channel_full_drops() {
        let (channel, _receiver) = ChangeChannel::new(1);
        channel.enqueue(sample_event("Pod", "a")).unwrap();
        let result = channel.enqueue(sample_event("Pod", "b"));
        assert_eq!(result, Err(DropReason::ChannelFull));
        assert_eq!(channel.drop_counters()[&DropReason::ChannelFull], 1);
    }
}
