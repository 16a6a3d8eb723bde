//! Typed Cache (C3, §4.3): watches the fixed set of well-known kinds
//! unconditionally from startup, using concrete k8s-openapi types rather
//! than `DynamicObject` so the store never depends on discovery having run.
//! Every object is still reduced to the same `ResourceSnapshot` shape used
//! by the dynamic cache at ingress (§9 "Dynamic typing of unstructured
//! objects"), so downstream consumers don't care which cache produced it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, Namespace, Node, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::{watcher, watcher::Config as WatcherConfig};
use kube::{Api, Client};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::config::Config as EngineConfig;
use super::change::{CacheOrigin, ChangeChannel, ChangeEvent, ChangeKind};
use super::diff::diff_snapshots;
use super::snapshot::{ResourceRef, ResourceSnapshot};
use super::timeline::historical::derive_label;
use super::transform::{project_event, to_snapshot};

type StoreKey = (String, Option<String>, String);
type Store = HashMap<StoreKey, ResourceSnapshot>;

fn store_key(r: &ResourceRef) -> StoreKey {
    (r.kind.clone(), r.namespace.clone(), r.name.clone())
}

/// Fixed-set watch-driven cache for the sixteen well-known kinds (§4.3).
pub struct TypedCache {
    client: Client,
    change_channel: ChangeChannel,
    sync_replay_threshold: chrono::Duration,
    store: Arc<RwLock<Store>>,
}

impl TypedCache {
    pub fn new(client: Client, change_channel: ChangeChannel, config: &EngineConfig) -> Self {
        Self {
            client,
            change_channel,
            sync_replay_threshold: chrono::Duration::from_std(config.sync_replay_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            store: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawns one watch task per well-known kind. This is the "critical"
    /// startup stage (§9 ordered startup): the engine does not consider
    /// itself connected until these tasks are spawned, though individual
    /// informers may still be completing their initial list in the
    /// background.
    pub fn spawn_all(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let all: std::collections::HashSet<String> =
            super::kind::WELL_KNOWN_KINDS.iter().map(|(kind, ..)| kind.to_string()).collect();
        self.spawn_enabled(&all)
    }

    /// Spawns watches only for the kinds the capability prober (C1) found
    /// enabled for the current identity; a kind denied at startup never
    /// gets an informer, matching `forbidden_per_kind` (§7).
    pub fn spawn_enabled(&self, enabled: &std::collections::HashSet<String>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if enabled.contains("Pod") {
            handles.push(self.spawn_watch::<Pod>("Pod"));
        }
        if enabled.contains("Service") {
            handles.push(self.spawn_watch::<Service>("Service"));
        }
        if enabled.contains("Deployment") {
            handles.push(self.spawn_watch::<Deployment>("Deployment"));
        }
        if enabled.contains("DaemonSet") {
            handles.push(self.spawn_watch::<DaemonSet>("DaemonSet"));
        }
        if enabled.contains("StatefulSet") {
            handles.push(self.spawn_watch::<StatefulSet>("StatefulSet"));
        }
        if enabled.contains("ReplicaSet") {
            handles.push(self.spawn_watch::<ReplicaSet>("ReplicaSet"));
        }
        if enabled.contains("Ingress") {
            handles.push(self.spawn_watch::<Ingress>("Ingress"));
        }
        if enabled.contains("ConfigMap") {
            handles.push(self.spawn_watch::<ConfigMap>("ConfigMap"));
        }
        if enabled.contains("Secret") {
            handles.push(self.spawn_watch::<Secret>("Secret"));
        }
        if enabled.contains("Event") {
            handles.push(self.spawn_event_watch());
        }
        if enabled.contains("PersistentVolumeClaim") {
            handles.push(self.spawn_watch::<PersistentVolumeClaim>("PersistentVolumeClaim"));
        }
        if enabled.contains("Node") {
            handles.push(self.spawn_watch::<Node>("Node"));
        }
        if enabled.contains("Namespace") {
            handles.push(self.spawn_watch::<Namespace>("Namespace"));
        }
        if enabled.contains("Job") {
            handles.push(self.spawn_watch::<Job>("Job"));
        }
        if enabled.contains("CronJob") {
            handles.push(self.spawn_watch::<CronJob>("CronJob"));
        }
        if enabled.contains("HorizontalPodAutoscaler") {
            handles.push(self.spawn_watch::<HorizontalPodAutoscaler>("HorizontalPodAutoscaler"));
        }
        handles
    }

    fn spawn_watch<K>(&self, kind: &'static str) -> tokio::task::JoinHandle<()>
    where
        K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + Send + Sync + 'static,
        K: serde::de::DeserializeOwned + serde::Serialize,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let store = self.store.clone();
        let change_channel = self.change_channel.clone();
        let sync_replay_threshold = self.sync_replay_threshold;

        tokio::spawn(async move {
            run_watch_loop(api, kind, store, change_channel, sync_replay_threshold, |value| value).await;
        })
    }

    /// `Event` gets the narrower projection applied at ingress (§4.3, §3)
    /// instead of the full object body.
    fn spawn_event_watch(&self) -> tokio::task::JoinHandle<()> {
        let api: Api<Event> = Api::all(self.client.clone());
        let store = self.store.clone();
        let change_channel = self.change_channel.clone();
        let sync_replay_threshold = self.sync_replay_threshold;

        tokio::spawn(async move {
            run_watch_loop(api, "Event", store, change_channel, sync_replay_threshold, |value| {
                project_event(&value)
            })
            .await;
        })
    }

    pub async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<ResourceSnapshot> {
        let key = (kind.to_string(), namespace.map(str::to_string), name.to_string());
        self.store.read().await.get(&key).cloned()
    }

    pub async fn list(&self, kind: &str, namespace: Option<&str>) -> Vec<ResourceSnapshot> {
        self.store
            .read()
            .await
            .values()
            .filter(|snap| snap.kind == kind && namespace.map_or(true, |ns| snap.namespace.as_deref() == Some(ns)))
            .cloned()
            .collect()
    }

    /// Lists pods matching a label selector, expressed as exact key=value
    /// pairs (§4.3 "label-selector queries").
    pub async fn list_pods_for(&self, namespace: Option<&str>, selector: &HashMap<String, String>) -> Vec<ResourceSnapshot> {
        self.store
            .read()
            .await
            .values()
            .filter(|snap| {
                snap.kind == "Pod"
                    && namespace.map_or(true, |ns| snap.namespace.as_deref() == Some(ns))
                    && selector.iter().all(|(k, v)| snap.labels.get(k) == Some(v))
            })
            .cloned()
            .collect()
    }

    pub async fn resource_count(&self) -> usize {
        self.store.read().await.len()
    }
}

/// Shared watch loop body: consumes a `watcher::Event<K>` stream, reduces
/// each object through `transform` into a snapshot, updates the store, and
/// enqueues a `ChangeEvent`. Restarts the underlying stream on timeout or
/// error rather than exiting the task, since a well-known kind's watch must
/// run for the process lifetime (§4.3).
async fn run_watch_loop<K>(
    api: Api<K>,
    kind: &'static str,
    store: Arc<RwLock<Store>>,
    change_channel: ChangeChannel,
    sync_replay_threshold: chrono::Duration,
    project: impl Fn(serde_json::Value) -> serde_json::Value + Copy,
) where
    K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + Send + Sync + 'static,
    K: serde::de::DeserializeOwned + serde::Serialize,
{
    loop {
        let watcher_config = WatcherConfig::default();
        let mut stream = watcher(api.clone(), watcher_config).boxed();

        loop {
            let next = timeout(StdDuration::from_secs(90), stream.next()).await;
            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => {
                    tracing::debug!(kind, "watch stream ended, restarting");
                    break;
                }
                Err(_) => {
                    tracing::warn!(kind, "watch stream idle beyond timeout, restarting");
                    break;
                }
            };

            match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    apply_object(kind, obj, &store, &change_channel, sync_replay_threshold, project).await;
                }
                Ok(watcher::Event::Delete(obj)) => {
                    delete_object(kind, obj, &store, &change_channel, project).await;
                }
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
                Err(err) => {
                    tracing::warn!(kind, error = %err, "watch error, restarting stream");
                    break;
                }
            }
        }
    }
}

async fn apply_object<K>(
    kind: &'static str,
    obj: K,
    store: &Arc<RwLock<Store>>,
    change_channel: &ChangeChannel,
    sync_replay_threshold: chrono::Duration,
    project: impl Fn(serde_json::Value) -> serde_json::Value,
) where
    K: serde::Serialize,
{
    let raw = match serde_json::to_value(&obj) {
        Ok(value) => project(value),
        Err(err) => {
            tracing::warn!(kind, error = %err, "failed to serialize watched object");
            return;
        }
    };
    let Some(snapshot) = to_snapshot(kind, raw) else {
        return;
    };
    let resource = snapshot.resource_ref();
    let key = store_key(&resource);

    let previous = {
        let mut guard = store.write().await;
        guard.insert(key, snapshot.clone())
    };

    let change = match &previous {
        Some(_) => ChangeKind::Modified,
        None => ChangeKind::Added,
    };

    let is_replay = change == ChangeKind::Added && snapshot.is_sync_replay(Utc::now(), sync_replay_threshold);
    if is_replay {
        tracing::trace!(kind, name = %snapshot.name, "sync replay, recorded without live notification priority");
    }

    let diff = previous.as_ref().map(|prev| {
        let mut diff = diff_snapshots(&prev.data, &snapshot.data);
        if let Some(label) = derive_label(kind, Some(&prev.data), &snapshot.data, Some(&diff)) {
            diff.summary = label;
        }
        diff
    });

    let _ = change_channel.enqueue(ChangeEvent {
        change,
        origin: CacheOrigin::Typed,
        resource,
        snapshot,
        diff,
        observed_at: Utc::now(),
    });
}

async fn delete_object<K>(
    kind: &'static str,
    obj: K,
    store: &Arc<RwLock<Store>>,
    change_channel: &ChangeChannel,
    project: impl Fn(serde_json::Value) -> serde_json::Value,
) where
    K: serde::Serialize,
{
    let raw = match serde_json::to_value(&obj) {
        Ok(value) => project(value),
        Err(err) => {
            tracing::warn!(kind, error = %err, "failed to serialize deleted object");
            return;
        }
    };
    let Some(snapshot) = to_snapshot(kind, raw) else {
        return;
    };
    let resource = snapshot.resource_ref();
    let key = store_key(&resource);
    store.write().await.remove(&key);

    let _ = change_channel.enqueue(ChangeEvent {
        change: ChangeKind::Deleted,
        origin: CacheOrigin::Typed,
        resource,
        snapshot,
        diff: None,
        observed_at: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_key_ignores_uid_matching_identity_key_semantics() {
        let a = ResourceRef {
            kind: "Pod".to_string(),
            namespace: Some("default".to_string()),
            name: "web-1".to_string(),
            uid: "uid-a".to_string(),
        };
        let b = ResourceRef {
            uid: "uid-b".to_string(),
            ..a.clone()
        };
        assert_eq!(store_key(&a), store_key(&b));
    }
}
