//! Timeline Store (C7, §4.7): a bounded, append-only log of `TimelineEvent`
//! records with a `seen` set for add/delete dedup and per-kind counters.
//!
//! Store append is the single place sync-replay suppression (§3, P2) and
//! at-most-one-add-per-uid (§3, P1) are enforced; both rely on the `seen`
//! set rather than on anything the caches themselves track, since a cache
//! restart must not let the store forget what it has already recorded.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::DropReason;
use crate::k8s::change::{ChangeEvent, ChangeKind};
use crate::k8s::diff::Diff;
use crate::k8s::snapshot::ResourceSnapshot;
use super::historical::{self, HistoricalItem};
use super::persist::TimelinePersistence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    K8sEvent,
    Historical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Informer,
    K8sEvent,
    Historical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// The unit stored in C7 (§3 "TimelineEvent").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub source: EventSource,
    pub health: Health,
    pub owner: Option<(String, String)>,
    pub labels: BTreeMap<String, String>,
    pub diff: Option<Diff>,
    pub message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Persisted representation is identical to the live one; kept as a
/// distinct name so the persistence module's contract reads independently
/// of the in-memory type (§6 "Persisted state").
pub type TimelineEntry = TimelineEvent;

fn identity_key(kind: &str, namespace: &Option<String>, name: &str) -> (String, Option<String>, String) {
    (kind.to_string(), namespace.clone(), name.to_string())
}

/// Named bundles of kind filters a query can select with `filter_preset` (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPreset {
    Default,
    Workloads,
}

const WORKLOAD_KINDS: &[&str] = &[
    "Pod",
    "Deployment",
    "DaemonSet",
    "StatefulSet",
    "ReplicaSet",
    "Job",
    "CronJob",
];

impl FilterPreset {
    pub fn parse(name: &str) -> Self {
        match name {
            "workloads" => FilterPreset::Workloads,
            _ => FilterPreset::Default,
        }
    }

    fn allows(&self, kind: &str) -> bool {
        match self {
            FilterPreset::Default => true,
            FilterPreset::Workloads => WORKLOAD_KINDS.contains(&kind),
        }
    }
}

/// Query options accepted by `TimelineStore::query` (§4.7).
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub namespaces: Vec<String>,
    pub kinds: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
    pub include_k8s_events: bool,
    pub include_managed: bool,
    pub filter_preset: Option<FilterPreset>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self {
            limit: 10_000,
            include_k8s_events: true,
            include_managed: false,
            ..Default::default()
        }
    }

    fn capped_limit(&self) -> usize {
        self.limit.min(10_000)
    }

    fn matches(&self, event: &TimelineEvent) -> bool {
        if !self.namespaces.is_empty() {
            let ns_match = event
                .namespace
                .as_deref()
                .map(|ns| self.namespaces.iter().any(|n| n == ns))
                .unwrap_or(false);
            if !ns_match {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.iter().any(|k| k == &event.kind) {
            return false;
        }
        if let Some(preset) = self.filter_preset {
            if !preset.allows(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if !self.include_k8s_events && event.event_type == EventType::K8sEvent {
            return false;
        }
        if !self.include_managed && event.owner.is_some() && event.event_type != EventType::K8sEvent {
            return false;
        }
        true
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TimelineMetrics {
    pub received: HashMap<String, u64>,
    pub recorded: u64,
    pub drops_by_reason: HashMap<DropReason, u64>,
    pub seen_count: usize,
    pub event_count: usize,
}

#[derive(Default)]
struct Counters {
    received: HashMap<String, u64>,
    recorded: u64,
    drops: HashMap<DropReason, u64>,
}

impl Counters {
    fn bump_received(&mut self, kind: &str) {
        *self.received.entry(kind.to_string()).or_insert(0) += 1;
    }

    fn bump_drop(&mut self, reason: DropReason) {
        *self.drops.entry(reason).or_insert(0) += 1;
    }
}

struct Inner {
    events: VecDeque<TimelineEvent>,
    seen: HashSet<(String, Option<String>, String)>,
    counters: Counters,
}

/// Bounded, queryable log of `TimelineEvent`s (C7). FIFO eviction by
/// capacity, `seen`-set dedup for adds, and historical-event derivation on
/// sync-replay adds and on every real add (§4.7).
pub struct TimelineStore {
    capacity: usize,
    sync_replay_threshold: chrono::Duration,
    inner: RwLock<Inner>,
    persistence: Option<Arc<TimelinePersistence>>,
}

impl TimelineStore {
    pub fn new(capacity: usize, sync_replay_threshold: std::time::Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            sync_replay_threshold: chrono::Duration::from_std(sync_replay_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            inner: RwLock::new(Inner {
                events: VecDeque::new(),
                seen: HashSet::new(),
                counters: Counters::default(),
            }),
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<TimelinePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Rehydrates the in-memory ring and `seen` set from a previously
    /// persisted log (§6 "Persisted state"): replays entries in file order,
    /// keeping only the tail up to `capacity`, and reconstructs `seen` from
    /// surviving add/delete pairs across the *entire* replayed sequence (not
    /// just the retained tail) so identity dedup stays correct.
    pub async fn hydrate_from(&self, entries: Vec<TimelineEntry>) {
        let mut seen = HashSet::new();
        for entry in &entries {
            let key = identity_key(&entry.kind, &entry.namespace, &entry.name);
            match entry.event_type {
                EventType::Created => {
                    seen.insert(key);
                }
                EventType::Deleted => {
                    seen.remove(&key);
                }
                _ => {}
            }
        }

        let capacity = self.capacity;
        let tail: VecDeque<TimelineEvent> = entries
            .into_iter()
            .rev()
            .take(capacity)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let mut inner = self.inner.write().await;
        inner.events = tail;
        inner.seen = seen;
    }

    fn push_evicting(events: &mut VecDeque<TimelineEvent>, capacity: usize, event: TimelineEvent) {
        events.push_back(event);
        while events.len() > capacity {
            events.pop_front();
        }
    }

    async fn persist(&self, event: &TimelineEvent) {
        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.append(event).await {
                tracing::warn!(error = %err, "failed to persist timeline event");
            }
        }
    }

    /// Records a resource-cache change notification (add/update/delete),
    /// applying the dedup, sync-replay and historical-derivation rules of
    /// §4.7. Returns the events actually appended (zero, one, or several for
    /// a sync-replay add that yields historical entries instead).
    pub async fn record_change(&self, change: &ChangeEvent) -> Vec<TimelineEvent> {
        let kind = change.resource.kind.clone();
        let namespace = change.resource.namespace.clone();
        let name = change.resource.name.clone();
        let key = identity_key(&kind, &namespace, &name);
        let now = change.observed_at;

        let mut inner = self.inner.write().await;
        inner.counters.bump_received(&kind);

        let mut appended = Vec::new();

        match change.change {
            ChangeKind::Added => {
                if inner.seen.contains(&key) {
                    inner.counters.bump_drop(DropReason::AlreadySeen);
                    drop(inner);
                    return appended;
                }

                let is_replay = change.snapshot.is_sync_replay(now, self.sync_replay_threshold);
                inner.seen.insert(key);

                if is_replay {
                    let items = historical::extract(&kind, &change.snapshot.data, change.snapshot.creation_timestamp);
                    for item in items {
                        let event = historical_event(&change.snapshot, item);
                        Self::push_evicting(&mut inner.events, self.capacity, event.clone());
                        appended.push(event);
                    }
                } else {
                    let event = TimelineEvent {
                        kind: kind.clone(),
                        namespace: namespace.clone(),
                        name: name.clone(),
                        uid: change.resource.uid.clone(),
                        timestamp: now,
                        event_type: EventType::Created,
                        source: EventSource::Informer,
                        health: Health::Unknown,
                        owner: change.snapshot.owner.clone(),
                        labels: change.snapshot.labels.clone(),
                        diff: None,
                        message: None,
                        created_at: change.snapshot.creation_timestamp,
                    };
                    Self::push_evicting(&mut inner.events, self.capacity, event.clone());
                    appended.push(event);

                    let items = historical::extract(&kind, &change.snapshot.data, change.snapshot.creation_timestamp);
                    for item in items {
                        let event = historical_event(&change.snapshot, item);
                        Self::push_evicting(&mut inner.events, self.capacity, event.clone());
                        appended.push(event);
                    }
                }
            }
            ChangeKind::Modified => {
                let event = TimelineEvent {
                    kind: kind.clone(),
                    namespace: namespace.clone(),
                    name: name.clone(),
                    uid: change.resource.uid.clone(),
                    timestamp: now,
                    event_type: EventType::Updated,
                    source: EventSource::Informer,
                    health: Health::Unknown,
                    owner: change.snapshot.owner.clone(),
                    labels: change.snapshot.labels.clone(),
                    diff: change.diff.clone(),
                    message: change.diff.as_ref().map(|d| d.summary.clone()),
                    created_at: change.snapshot.creation_timestamp,
                };
                Self::push_evicting(&mut inner.events, self.capacity, event.clone());
                appended.push(event);
            }
            ChangeKind::Deleted => {
                inner.seen.remove(&key);
                let event = TimelineEvent {
                    kind: kind.clone(),
                    namespace: namespace.clone(),
                    name: name.clone(),
                    uid: change.resource.uid.clone(),
                    timestamp: now,
                    event_type: EventType::Deleted,
                    source: EventSource::Informer,
                    health: Health::Unknown,
                    owner: change.snapshot.owner.clone(),
                    labels: change.snapshot.labels.clone(),
                    diff: None,
                    message: None,
                    created_at: change.snapshot.creation_timestamp,
                };
                Self::push_evicting(&mut inner.events, self.capacity, event.clone());
                appended.push(event);
            }
        }

        inner.counters.recorded += appended.len() as u64;
        drop(inner);

        for event in &appended {
            self.persist(event).await;
        }
        appended
    }

    /// Records a native `Event` object, with its controller-owner already
    /// resolved by the caller (the dispatcher, via the typed cache, §4.5).
    pub async fn record_k8s_event(
        &self,
        snapshot: &ResourceSnapshot,
        owner: Option<(String, String)>,
        timestamp: DateTime<Utc>,
    ) -> TimelineEvent {
        let reason = snapshot.data.get("reason").and_then(|v| v.as_str()).unwrap_or("");
        let message = snapshot.data.get("message").and_then(|v| v.as_str());
        let event_type_field = snapshot.data.get("type").and_then(|v| v.as_str()).unwrap_or("Normal");

        let involved = snapshot.data.get("involvedObject");
        let involved_kind = involved.and_then(|v| v.get("kind")).and_then(|v| v.as_str()).unwrap_or("");
        let involved_name = involved.and_then(|v| v.get("name")).and_then(|v| v.as_str()).unwrap_or("");
        let involved_namespace = involved
            .and_then(|v| v.get("namespace"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let health = if event_type_field == "Warning" {
            Health::Degraded
        } else {
            Health::Healthy
        };

        let event = TimelineEvent {
            kind: involved_kind.to_string(),
            namespace: involved_namespace,
            name: involved_name.to_string(),
            uid: snapshot.uid.clone(),
            timestamp,
            event_type: EventType::K8sEvent,
            source: EventSource::K8sEvent,
            health,
            owner,
            labels: BTreeMap::new(),
            diff: None,
            message: Some(format!("{reason}: {}", message.unwrap_or_default())),
            created_at: snapshot.creation_timestamp,
        };

        let mut inner = self.inner.write().await;
        inner.counters.bump_received("Event");
        Self::push_evicting(&mut inner.events, self.capacity, event.clone());
        inner.counters.recorded += 1;
        drop(inner);

        self.persist(&event).await;
        event
    }

    pub async fn record_drop(&self, reason: DropReason) {
        self.inner.write().await.counters.bump_drop(reason);
    }

    /// Runs a query against the current in-memory window, returning results
    /// in ascending-timestamp order, ties broken by insertion order (§4.7, P5).
    pub async fn query(&self, options: &QueryOptions) -> Vec<TimelineEvent> {
        let inner = self.inner.read().await;
        let mut matched: Vec<TimelineEvent> = inner
            .events
            .iter()
            .filter(|event| options.matches(event))
            .cloned()
            .collect();
        drop(inner);

        matched.sort_by_key(|event| event.timestamp);
        matched.truncate(options.capped_limit());
        matched
    }

    /// Events whose recorded `owner` matches `(owner_kind, owner_name)` in
    /// `owner_namespace`, ascending by timestamp (§4.7 "Additional query").
    pub async fn changes_for_owner(
        &self,
        owner_kind: &str,
        owner_namespace: &str,
        owner_name: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<TimelineEvent> {
        let inner = self.inner.read().await;
        let mut matched: Vec<TimelineEvent> = inner
            .events
            .iter()
            .filter(|event| {
                event.namespace.as_deref() == Some(owner_namespace)
                    && event.owner.as_ref().map(|(k, n)| k == owner_kind && n == owner_name).unwrap_or(false)
                    && since.map(|s| event.timestamp >= s).unwrap_or(true)
            })
            .cloned()
            .collect();
        drop(inner);

        matched.sort_by_key(|event| event.timestamp);
        matched.truncate(limit.min(10_000).max(1));
        matched
    }

    pub async fn debug_metrics(&self) -> TimelineMetrics {
        let inner = self.inner.read().await;
        TimelineMetrics {
            received: inner.counters.received.clone(),
            recorded: inner.counters.recorded,
            drops_by_reason: inner.counters.drops.clone(),
            seen_count: inner.seen.len(),
            event_count: inner.events.len(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot_entries(&self) -> Vec<TimelineEntry> {
        self.inner.read().await.events.iter().cloned().collect()
    }

    /// Clears all state. Used by C9's context-switch teardown (§4.9): the
    /// pre-switch `seen` set must be empty once the new connection starts (S5).
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.events.clear();
        inner.seen.clear();
        inner.counters = Counters::default();
    }
}

fn historical_event(snapshot: &ResourceSnapshot, item: HistoricalItem) -> TimelineEvent {
    TimelineEvent {
        kind: snapshot.kind.clone(),
        namespace: snapshot.namespace.clone(),
        name: snapshot.name.clone(),
        uid: snapshot.uid.clone(),
        timestamp: item.timestamp,
        event_type: EventType::Historical,
        source: EventSource::Historical,
        health: item.health,
        owner: snapshot.owner.clone(),
        labels: snapshot.labels.clone(),
        diff: None,
        message: Some(item.label),
        created_at: snapshot.creation_timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::change::CacheOrigin;
    use crate::k8s::snapshot::ResourceRef;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn snapshot(kind: &str, name: &str, uid: &str, created_at: DateTime<Utc>) -> ResourceSnapshot {
        ResourceSnapshot {
            kind: kind.to_string(),
            namespace: Some("default".to_string()),
            name: name.to_string(),
            uid: uid.to_string(),
            resource_version: None,
            creation_timestamp: Some(created_at),
            labels: BTreeMap::new(),
            owner: None,
            data: json!({"status": {}}),
        }
    }

    fn add_event(kind: &str, name: &str, uid: &str, created_at: DateTime<Utc>, observed_at: DateTime<Utc>) -> ChangeEvent {
        let snap = snapshot(kind, name, uid, created_at);
        ChangeEvent {
            change: ChangeKind::Added,
            origin: CacheOrigin::Typed,
            resource: snap.resource_ref(),
            snapshot: snap,
            diff: None,
            observed_at,
        }
    }

    fn delete_event(kind: &str, name: &str, uid: &str, observed_at: DateTime<Utc>) -> ChangeEvent {
        let snap = snapshot(kind, name, uid, observed_at);
        ChangeEvent {
            change: ChangeKind::Deleted,
            origin: CacheOrigin::Typed,
            resource: snap.resource_ref(),
            snapshot: snap,
            diff: None,
            observed_at,
        }
    }

    #[tokio::test]
    async fn at_most_one_add_per_identity_until_delete() {
        let store = TimelineStore::new(100, StdDuration::from_secs(30));
        let now = Utc::now();
        let first = store.record_change(&add_event("Pod", "x", "uid-1", now, now)).await;
        assert_eq!(first.len(), 1);
        let duplicate = store.record_change(&add_event("Pod", "x", "uid-1", now, now)).await;
        assert!(duplicate.is_empty());

        store.record_change(&delete_event("Pod", "x", "uid-1", now)).await;
        let recreated = store.record_change(&add_event("Pod", "x", "uid-2", now, now)).await;
        assert_eq!(recreated.len(), 1);
    }

    #[tokio::test]
    async fn sync_replay_suppresses_add_but_keeps_historical() {
        let store = TimelineStore::new(100, StdDuration::from_secs(30));
        let now = Utc::now();
        let old_creation = now - chrono::Duration::seconds(60);
        let mut event = add_event("Service", "svc", "uid-1", old_creation, now);
        event.snapshot.data = json!({});
        let appended = store.record_change(&event).await;
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].event_type, EventType::Historical);
    }

    #[tokio::test]
    async fn fifo_eviction_keeps_last_n() {
        let store = TimelineStore::new(10, StdDuration::from_secs(30));
        let now = Utc::now();
        for i in 0..15 {
            let ts = now + chrono::Duration::seconds(i);
            store
                .record_change(&add_event("Pod", &format!("p{i}"), &format!("uid-{i}"), ts, ts))
                .await;
        }
        let options = QueryOptions {
            limit: 200,
            ..QueryOptions::new()
        };
        let results = store.query(&options).await;
        assert_eq!(results.len(), 10);
        assert_eq!(results[0].name, "p5");
        assert_eq!(results[9].name, "p14");
    }

    #[tokio::test]
    async fn query_orders_ascending_by_timestamp() {
        let store = TimelineStore::new(100, StdDuration::from_secs(30));
        let now = Utc::now();
        store.record_change(&add_event("Pod", "b", "uid-b", now, now + chrono::Duration::seconds(5))).await;
        store.record_change(&add_event("Pod", "a", "uid-a", now, now)).await;
        let results = store.query(&QueryOptions::new()).await;
        assert_eq!(results[0].name, "a");
        assert_eq!(results[1].name, "b");
    }

    #[tokio::test]
    async fn reset_clears_seen_and_events() {
        let store = TimelineStore::new(100, StdDuration::from_secs(30));
        let now = Utc::now();
        store.record_change(&add_event("Pod", "x", "uid-1", now, now)).await;
        store.reset().await;
        assert_eq!(store.len().await, 0);
        let metrics = store.debug_metrics().await;
        assert_eq!(metrics.seen_count, 0);
    }
}
