//! Dynamic Cache (C4, §4.4): on-demand watches for any GVR not in the
//! typed cache's fixed set, keyed by discovery so CRDs work without a code
//! change. An access probe (a cheap `list` with `limit=1`) gates whether a
//! GVR is even attempted, so a forbidden kind fails once instead of
//! spinning a watch that will never succeed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use futures::{stream, StreamExt};
use kube::api::{DynamicObject, ListParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::runtime::{watcher, watcher::Config as WatcherConfig};
use kube::{Api, Client};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::config::Config as EngineConfig;
use crate::errors::{is_forbidden, EngineError, EngineResult};
use super::change::{CacheOrigin, ChangeChannel, ChangeEvent, ChangeKind};
use super::diff::diff_snapshots;
use super::discovery::ApiDiscovery;
use super::kind::Gvr;
use super::snapshot::{ResourceRef, ResourceSnapshot};
use super::timeline::historical::derive_label;
use super::transform::to_snapshot;

/// Readiness of one GVR's informer (§4.4). `Discovering` covers both the
/// discovery lookup and the informer's initial list/sync; `Ready` is
/// reached even if the initial sync itself fails, since a broken informer
/// still shouldn't block the caller forever (panic-recovery-to-ready, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    Idle,
    Discovering,
    Ready,
}

impl From<u8> for WatchStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => WatchStatus::Discovering,
            2 => WatchStatus::Ready,
            _ => WatchStatus::Idle,
        }
    }
}

impl From<WatchStatus> for u8 {
    fn from(value: WatchStatus) -> Self {
        match value {
            WatchStatus::Idle => 0,
            WatchStatus::Discovering => 1,
            WatchStatus::Ready => 2,
        }
    }
}

struct Informer {
    status: Arc<AtomicU8>,
    handle: tokio::task::JoinHandle<()>,
}

type StoreKey = (Gvr, Option<String>, String);
type Store = HashMap<StoreKey, ResourceSnapshot>;

pub struct DynamicCache {
    client: Client,
    discovery: Arc<ApiDiscovery>,
    change_channel: ChangeChannel,
    crd_discovery_wait: StdDuration,
    initial_sync_timeout: StdDuration,
    warmup_concurrency: usize,
    sync_replay_threshold: chrono::Duration,
    informers: RwLock<HashMap<Gvr, Informer>>,
    store: Arc<RwLock<Store>>,
}

impl DynamicCache {
    pub fn new(
        client: Client,
        discovery: Arc<ApiDiscovery>,
        change_channel: ChangeChannel,
        config: &EngineConfig,
    ) -> Self {
        Self {
            client,
            discovery,
            change_channel,
            crd_discovery_wait: config.crd_discovery_wait,
            initial_sync_timeout: config.initial_sync_timeout,
            warmup_concurrency: config.warmup_concurrency,
            sync_replay_threshold: chrono::Duration::from_std(config.sync_replay_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            informers: RwLock::new(HashMap::new()),
            store: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn status(&self, gvr: &Gvr) -> WatchStatus {
        self.informers
            .read()
            .await
            .get(gvr)
            .map(|informer| WatchStatus::from(informer.status.load(Ordering::Acquire)))
            .unwrap_or(WatchStatus::Idle)
    }

    /// Idempotently starts watching `gvr`. Runs the access probe
    /// synchronously, *before* anything is registered in the informer map,
    /// so a forbidden GVR never creates an informer and never appears in
    /// `watched_resources()` (§4.4 steps 1-6, P7) — only a probe that
    /// succeeds (or fails for a reason other than permission) gets as far
    /// as spawning a watch loop.
    pub async fn ensure_watching(&self, gvr: Gvr) -> EngineResult<()> {
        if self.status(&gvr).await != WatchStatus::Idle {
            return Ok(());
        }
        if self.informers.read().await.contains_key(&gvr) {
            return Ok(());
        }

        let descriptor = match self.discovery.descriptor(&gvr) {
            Some(descriptor) => Some(descriptor),
            None => {
                let _ = self.discovery.refresh().await;
                self.discovery.descriptor(&gvr)
            }
        };
        let Some(descriptor) = descriptor else {
            return Err(EngineError::UnknownKind { kind: gvr.to_string() });
        };
        if !descriptor.supports_watch() {
            return Err(EngineError::ForbiddenKind { kind: gvr.to_string() });
        }

        let api_resource = ApiResource {
            group: gvr.group.clone(),
            version: gvr.version.clone(),
            api_version: gvr.api_version(),
            kind: descriptor.singular_kind.clone(),
            plural: gvr.resource.clone(),
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &api_resource);
        let probe = timeout(StdDuration::from_secs(5), api.list(&ListParams::default().limit(1))).await;
        if let Ok(Err(err)) = &probe {
            if is_forbidden(err) {
                tracing::warn!(gvr = %gvr, "access probe denied, not creating informer");
                return Err(EngineError::ForbiddenKind { kind: gvr.to_string() });
            }
        }

        {
            let mut informers = self.informers.write().await;
            if informers.contains_key(&gvr) {
                return Ok(());
            }
            let status = Arc::new(AtomicU8::new(WatchStatus::Discovering.into()));
            let handle = self.spawn_watch_loop(gvr.clone(), descriptor.singular_kind.clone(), api, status.clone());
            informers.insert(gvr.clone(), Informer { status, handle });
        }

        let waited = timeout(self.crd_discovery_wait, self.wait_until_ready(&gvr)).await;
        if waited.is_err() {
            tracing::debug!(gvr = %gvr, "informer still discovering after wait bound, returning early");
        }
        Ok(())
    }

    async fn wait_until_ready(&self, gvr: &Gvr) {
        loop {
            if self.status(gvr).await == WatchStatus::Ready {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(25)).await;
        }
    }

    /// Starts watches for every GVR concurrently, bounded by
    /// `warmup_concurrency` (§4.4: 50), for CRD-sweep warmup at startup.
    pub async fn warmup_parallel(&self, gvrs: Vec<Gvr>, bound: StdDuration) {
        let results = stream::iter(gvrs.into_iter().map(|gvr| async move {
            let _ = timeout(bound, self.ensure_watching(gvr.clone())).await;
        }))
        .buffer_unordered(self.warmup_concurrency)
        .collect::<Vec<_>>()
        .await;
        tracing::debug!(count = results.len(), "dynamic cache warmup complete");
    }

    /// Spawns the watch loop for a GVR whose access probe has already
    /// passed. `status` transitions to `Ready` only once the watcher's
    /// initial sync completes (or the sync timeout elapses), matching
    /// §4.4 step 6's "background task waits for initial sync and marks the
    /// GVR as synced" rather than treating "probe passed" as "synced".
    fn spawn_watch_loop(
        &self,
        gvr: Gvr,
        kind: String,
        api: Api<DynamicObject>,
        status: Arc<AtomicU8>,
    ) -> tokio::task::JoinHandle<()> {
        let change_channel = self.change_channel.clone();
        let store = self.store.clone();
        let initial_sync_timeout = self.initial_sync_timeout;
        let sync_replay_threshold = self.sync_replay_threshold;

        tokio::spawn(async move {
            run_dynamic_watch_loop(
                api,
                gvr,
                kind,
                store,
                change_channel,
                sync_replay_threshold,
                initial_sync_timeout,
                status,
            )
            .await;
        })
    }

    pub async fn get(&self, gvr: &Gvr, namespace: Option<&str>, name: &str) -> Option<ResourceSnapshot> {
        let key = (gvr.clone(), namespace.map(str::to_string), name.to_string());
        self.store.read().await.get(&key).cloned()
    }

    pub async fn list(&self, gvr: &Gvr, namespace: Option<&str>) -> Vec<ResourceSnapshot> {
        self.store
            .read()
            .await
            .iter()
            .filter(|((k, ns, _), _)| k == gvr && namespace.map_or(true, |n| ns.as_deref() == Some(n)))
            .map(|(_, snap)| snap.clone())
            .collect()
    }

    /// Blocking variant that waits for the informer to reach `Ready` before
    /// returning its current contents, up to `initial_sync_timeout`.
    pub async fn list_blocking(&self, gvr: &Gvr, namespace: Option<&str>) -> Vec<ResourceSnapshot> {
        let _ = timeout(self.initial_sync_timeout, self.wait_until_ready(gvr)).await;
        self.list(gvr, namespace).await
    }

    pub async fn watched_resources(&self) -> Vec<Gvr> {
        self.informers.read().await.keys().cloned().collect()
    }

    pub async fn informer_count(&self) -> usize {
        self.informers.read().await.len()
    }

    pub async fn is_synced(&self, gvr: &Gvr) -> bool {
        self.status(gvr).await == WatchStatus::Ready
    }
}

async fn run_dynamic_watch_loop(
    api: Api<DynamicObject>,
    gvr: Gvr,
    kind: String,
    store: Arc<RwLock<Store>>,
    change_channel: ChangeChannel,
    sync_replay_threshold: chrono::Duration,
    initial_sync_timeout: StdDuration,
    status: Arc<AtomicU8>,
) {
    let sync_deadline = tokio::time::Instant::now() + initial_sync_timeout;
    let mut synced = false;

    loop {
        let mut stream = watcher(api.clone(), WatcherConfig::default()).boxed();

        loop {
            if !synced && tokio::time::Instant::now() >= sync_deadline {
                tracing::debug!(gvr = %gvr, "initial sync wait elapsed, marking ready anyway");
                status.store(WatchStatus::Ready.into(), Ordering::Release);
                synced = true;
            }

            let poll_bound = if synced {
                StdDuration::from_secs(90)
            } else {
                let remaining = sync_deadline.saturating_duration_since(tokio::time::Instant::now());
                remaining.min(StdDuration::from_secs(90)).max(StdDuration::from_millis(50))
            };
            let next = timeout(poll_bound, stream.next()).await;

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) if !synced => {
                    // poll_bound was clamped to the remaining sync wait, not a
                    // real idle timeout; loop back to re-check the deadline.
                    continue;
                }
                Err(_) => {
                    tracing::debug!(gvr = %gvr, "dynamic watch idle beyond timeout, restarting");
                    break;
                }
            };

            match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    apply_dynamic(&gvr, &kind, obj, &store, &change_channel, sync_replay_threshold).await;
                }
                Ok(watcher::Event::Delete(obj)) => {
                    delete_dynamic(&gvr, &kind, obj, &store, &change_channel).await;
                }
                Ok(watcher::Event::Init) => {}
                Ok(watcher::Event::InitDone) => {
                    status.store(WatchStatus::Ready.into(), Ordering::Release);
                    synced = true;
                }
                Err(err) => {
                    tracing::warn!(gvr = %gvr, error = %err, "dynamic watch error, restarting stream");
                    break;
                }
            }
        }
    }
}

async fn apply_dynamic(
    gvr: &Gvr,
    kind: &str,
    obj: DynamicObject,
    store: &Arc<RwLock<Store>>,
    change_channel: &ChangeChannel,
    sync_replay_threshold: chrono::Duration,
) {
    let raw = match serde_json::to_value(&obj) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(gvr = %gvr, error = %err, "failed to serialize dynamic object");
            return;
        }
    };
    let Some(snapshot) = to_snapshot(kind, raw) else {
        return;
    };
    let resource = snapshot.resource_ref();
    let key = (gvr.clone(), resource.namespace.clone(), resource.name.clone());

    let previous = store.write().await.insert(key, snapshot.clone());
    let change = if previous.is_some() {
        ChangeKind::Modified
    } else {
        ChangeKind::Added
    };

    if change == ChangeKind::Added && snapshot.is_sync_replay(Utc::now(), sync_replay_threshold) {
        tracing::trace!(gvr = %gvr, name = %snapshot.name, "sync replay");
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
        origin: CacheOrigin::Dynamic,
        resource,
        snapshot,
        diff,
        observed_at: Utc::now(),
    });
}

async fn delete_dynamic(
    gvr: &Gvr,
    kind: &str,
    obj: DynamicObject,
    store: &Arc<RwLock<Store>>,
    change_channel: &ChangeChannel,
) {
    let raw = match serde_json::to_value(&obj) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(gvr = %gvr, error = %err, "failed to serialize deleted dynamic object");
            return;
        }
    };
    let Some(snapshot) = to_snapshot(kind, raw) else {
        return;
    };
    let resource = snapshot.resource_ref();
    let key = (gvr.clone(), resource.namespace.clone(), resource.name.clone());
    store.write().await.remove(&key);

    let _ = change_channel.enqueue(ChangeEvent {
        change: ChangeKind::Deleted,
        origin: CacheOrigin::Dynamic,
        resource,
        snapshot,
        diff: None,
        observed_at: Utc::now(),
    });
}

/// Resolves a plain `kind` string against discovery before delegating to
/// `ensure_watching`, for callers (HTTP handlers) that only know a name.
pub async fn ensure_watching_by_kind(
    cache: &DynamicCache,
    discovery: &ApiDiscovery,
    kind: &str,
) -> Result<Gvr, EngineError> {
    let gvr = discovery.resolve_kind(kind)?;
    cache.ensure_watching(gvr.clone()).await?;
    Ok(gvr)
}

/// Helper retained for callers that already have a full `GroupVersionKind`
/// (e.g. a UI deep link) rather than a bare kind name.
pub fn gvk_to_gvr(gvk: &GroupVersionKind, plural: &str) -> Gvr {
    Gvr::new(gvk.group.clone(), gvk.version.clone(), plural.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_status_roundtrips_through_u8() {
        assert_eq!(WatchStatus::from(u8::from(WatchStatus::Ready)), WatchStatus::Ready);
        assert_eq!(WatchStatus::from(u8::from(WatchStatus::Discovering)), WatchStatus::Discovering);
        assert_eq!(WatchStatus::from(0), WatchStatus::Idle);
    }
}
