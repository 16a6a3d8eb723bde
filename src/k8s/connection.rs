//! Connection Controller (C9, §4.9): owns the lifecycle of C1-C8 for one
//! cluster connection, runs the ordered startup sequence, and performs
//! context switches as an atomic tear-down-then-rebuild. Holds the
//! dispatcher that drains the Change Channel (C5) into the Timeline Store
//! (C7) and the Broadcaster (C8) — see DESIGN.md for why that fan-out lives
//! here rather than inline in the watch handlers.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::cleanup::TaskManager;
use crate::config::{Config, TimelineStorageKind};
use crate::errors::{classify_kube_error, EngineError, EngineResult, ErrorClass};

use super::broadcast::Broadcaster;
use super::capability::{CapabilityProber, CapabilityQuery};
use super::change::{ChangeChannel, ChangeEvent, ChangeKind};
use super::client::K8sClient;
use super::discovery::ApiDiscovery;
use super::dynamic_cache::DynamicCache;
use super::kind::WELL_KNOWN_KINDS;
use super::timeline::TimelineStore;
use super::typed_cache::TypedCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorType {
    Auth,
    Network,
    Timeout,
    Unknown,
}

impl From<ErrorClass> for ConnectionErrorType {
    fn from(value: ErrorClass) -> Self {
        match value {
            ErrorClass::Auth => ConnectionErrorType::Auth,
            ErrorClass::Network => ConnectionErrorType::Network,
            ErrorClass::Timeout => ConnectionErrorType::Timeout,
            ErrorClass::Unknown => ConnectionErrorType::Unknown,
        }
    }
}

/// Published on the status channel (§4.9 "publishes a progress message")
/// and fanned out to subscribers as a `connection_status` message (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub context: Option<String>,
    pub progress: Option<String>,
    pub error: Option<String>,
    pub error_type: Option<ConnectionErrorType>,
}

impl ConnectionStatus {
    fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            context: None,
            progress: None,
            error: None,
            error_type: None,
        }
    }

    fn connecting(context: Option<String>, progress: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Connecting,
            context,
            progress: Some(progress.into()),
            error: None,
            error_type: None,
        }
    }

    fn connected(context: Option<String>) -> Self {
        Self {
            state: ConnectionState::Connected,
            context,
            progress: None,
            error: None,
            error_type: None,
        }
    }

    fn failed(context: Option<String>, error: String, error_type: ConnectionErrorType) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            context,
            progress: None,
            error: Some(error),
            error_type: Some(error_type),
        }
    }
}

/// Reset/reinit callbacks for non-core collaborators (§6 "Consumed"):
/// timeline persistence, Helm, Traffic. Registered once at boot; invoked in
/// the fixed order §5 specifies, with each failure swallowed and logged so
/// one collaborator can't block the others.
pub type ReinitCallback = Arc<dyn Fn() -> futures::future::BoxFuture<'static, EngineResult<()>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct CollaboratorHooks {
    pub traffic_reinit: Option<ReinitCallback>,
    pub helm_reinit: Option<ReinitCallback>,
    pub metrics_reinit: Option<ReinitCallback>,
}

async fn run_hook(name: &str, hook: &Option<ReinitCallback>) {
    if let Some(hook) = hook {
        if let Err(err) = hook().await {
            tracing::warn!(collaborator = name, error = %err, "non-critical collaborator reinit failed");
        }
    }
}

/// Owns one cluster connection's full subsystem set (C1-C8). Built fresh by
/// `connect`; a context switch builds a brand new instance and atomically
/// swaps it in at the `Engine` layer rather than mutating this one in place
/// (§9 "Reset transitions must swap the owning value atomically").
pub struct ConnectionController {
    pub client: K8sClient,
    pub discovery: Arc<ApiDiscovery>,
    pub capability: Arc<CapabilityProber>,
    pub typed_cache: Arc<TypedCache>,
    pub dynamic_cache: Arc<DynamicCache>,
    pub timeline: Arc<TimelineStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub status: Arc<RwLock<ConnectionStatus>>,
    pub context_name: Option<String>,
    pub restricted_kinds: Arc<RwLock<HashSet<String>>>,
    tasks: TaskManager,
    config: Config,
}

impl ConnectionController {
    /// Runs the full ordered startup sequence (§4.9 steps 1-6). Only step 2
    /// (typed cache) is critical: any other step's failure is logged and
    /// the sequence continues degraded.
    pub async fn connect(
        config: Config,
        context_name: Option<String>,
        broadcaster: Arc<Broadcaster>,
        hooks: CollaboratorHooks,
    ) -> EngineResult<Arc<Self>> {
        let status = Arc::new(RwLock::new(ConnectionStatus::connecting(context_name.clone(), "resolving kubeconfig")));
        broadcaster.publish_status(status.read().await.clone()).await;

        let k8s_client = K8sClient::new();
        if let Err(err) = k8s_client.connect_with_context(&config, context_name.as_deref()).await {
            let classified = classify_error(&err);
            let failed = ConnectionStatus::failed(context_name.clone(), err.to_string(), classified);
            *status.write().await = failed.clone();
            broadcaster.publish_status(failed).await;
            return Err(err);
        }
        let client = k8s_client.get_client().await?;

        // Fatal startup gate (§4.9 step 2 "Critical"): a client that cannot
        // even answer the apiserver version query will never successfully
        // run the typed cache's watches either, so fail fast here instead
        // of discovering it sixteen watch-task failures later.
        *status.write().await = ConnectionStatus::connecting(context_name.clone(), "verifying cluster connectivity");
        if let Err(err) = client.apiserver_version().await {
            let classified = classify_error(&EngineError::Kube(err));
            let message = "cluster connectivity check failed".to_string();
            let failed = ConnectionStatus::failed(context_name.clone(), message.clone(), classified);
            *status.write().await = failed.clone();
            broadcaster.publish_status(failed).await;
            return Err(EngineError::Fatal {
                component: "typed_cache".to_string(),
                message,
            });
        }

        let tasks = TaskManager::new("connection-controller");

        // Step 1: timeline store (non-critical).
        *status.write().await = ConnectionStatus::connecting(context_name.clone(), "initializing timeline store");
        let mut timeline_store = TimelineStore::new(config.history_limit, config.sync_replay_threshold);
        if let (TimelineStorageKind::Sqlite, Some(path)) = (config.timeline_storage, &config.timeline_db_path) {
            match super::timeline::TimelinePersistence::load_existing(path).await {
                Ok(entries) => timeline_store.hydrate_from(entries).await,
                Err(err) => tracing::warn!(error = %err, "failed to load existing timeline log"),
            }
            match super::timeline::TimelinePersistence::open(path).await {
                Ok(persistence) => {
                    timeline_store = timeline_store.with_persistence(Arc::new(persistence));
                }
                Err(err) => tracing::warn!(error = %err, "failed to open timeline persistence file, continuing in-memory only"),
            }
        }
        let timeline = Arc::new(timeline_store);

        // Step 2: typed cache (critical, gated per-kind by capability probes).
        *status.write().await = ConnectionStatus::connecting(context_name.clone(), "probing capabilities");
        let capability = Arc::new(CapabilityProber::new(client.clone(), config.capability_cache_ttl));
        let (enabled, restricted) = probe_well_known_kinds(&capability, config.namespace.as_deref()).await;

        *status.write().await = ConnectionStatus::connecting(context_name.clone(), "starting typed cache watches");
        let (change_channel, mut change_rx) = ChangeChannel::new(config.change_channel_capacity);
        let typed_cache = Arc::new(TypedCache::new(client.clone(), change_channel.clone(), &config));
        for (index, handle) in typed_cache.spawn_enabled(&enabled).into_iter().enumerate() {
            let _ = tasks.spawn_task(format!("typed-watch-{index}"), "typed cache watch", async move {
                let _ = handle.await;
            }).await;
        }

        // Step 3: API resource discovery (non-critical).
        *status.write().await = ConnectionStatus::connecting(context_name.clone(), "discovering API resources");
        let discovery = Arc::new(ApiDiscovery::new(client.clone()));
        if let Err(err) = discovery.refresh().await {
            tracing::warn!(error = %err, "API resource discovery failed, continuing without CRD support");
        }

        // Step 4: dynamic cache (non-critical), CRD warmup runs in the background.
        *status.write().await = ConnectionStatus::connecting(context_name.clone(), "starting dynamic cache");
        let dynamic_cache = Arc::new(DynamicCache::new(client.clone(), discovery.clone(), change_channel.clone(), &config));
        {
            let dynamic_cache = dynamic_cache.clone();
            let discovery = discovery.clone();
            let crd_discovery_wait = config.crd_discovery_wait;
            let _ = tasks.spawn_task("crd-warmup", "CRD discovery warmup", async move {
                let crds = discovery.crd_descriptors();
                let gvrs = crds
                    .into_iter()
                    .filter(|d| d.supports_watch())
                    .map(|d| d.gvr)
                    .collect::<Vec<_>>();
                dynamic_cache.warmup_parallel(gvrs, crd_discovery_wait).await;
            }).await;
        }

        // Step 5: metrics history (collaborator; interface only, non-critical).
        run_hook("metrics", &hooks.metrics_reinit).await;

        // Step 6: Helm and Traffic reinit (collaborators; non-critical).
        run_hook("helm", &hooks.helm_reinit).await;
        run_hook("traffic", &hooks.traffic_reinit).await;

        let connected_status = ConnectionStatus::connected(context_name.clone());
        *status.write().await = connected_status.clone();
        broadcaster.publish_status(connected_status).await;

        let controller = Arc::new(Self {
            client: k8s_client,
            discovery,
            capability,
            typed_cache,
            dynamic_cache,
            timeline: timeline.clone(),
            broadcaster: broadcaster.clone(),
            status,
            context_name,
            restricted_kinds: Arc::new(RwLock::new(restricted)),
            tasks,
            config,
        });

        // Dispatcher: drains the Change Channel into the timeline store and
        // the broadcaster. See DESIGN.md for why this single-consumer
        // dispatch replaces per-handler inline store appends.
        {
            let timeline = timeline.clone();
            let broadcaster = broadcaster.clone();
            let typed_cache_for_owner = controller.typed_cache.clone();
            let _ = controller
                .tasks
                .spawn_task("change-dispatcher", "change channel dispatcher", async move {
                    dispatch_loop(&mut change_rx, timeline, broadcaster, typed_cache_for_owner).await;
                })
                .await;
        }

        Ok(controller)
    }

    /// Ordered reverse teardown (§4.9): traffic, helm, metrics, dynamic,
    /// discovery, typed, timeline. Each step is wrapped so a panic or error
    /// in one cannot prevent the rest from running.
    pub async fn disconnect(&self) {
        if let Err(err) = self.tasks.cleanup().await {
            tracing::warn!(error = %err, "error stopping connection controller tasks");
        }
        self.broadcaster.teardown().await;
        self.timeline.reset().await;
        self.client.disconnect().await;
        *self.status.write().await = ConnectionStatus::disconnected();
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.status.read().await.clone()
    }

    pub async fn active_task_count(&self) -> usize {
        self.tasks.active_task_count().await
    }

    pub async fn restricted_kinds(&self) -> Vec<String> {
        let mut list: Vec<String> = self.restricted_kinds.read().await.iter().cloned().collect();
        list.sort();
        list
    }
}

/// Probes every well-known kind (§4.1) for list access, returning the
/// enabled set (spawned by the typed cache) and the restricted set
/// (surfaced via `cluster_info.counts.restricted`, §7 `forbidden_per_kind`).
async fn probe_well_known_kinds(
    capability: &CapabilityProber,
    namespace: Option<&str>,
) -> (HashSet<String>, HashSet<String>) {
    let mut enabled = HashSet::new();
    let mut restricted = HashSet::new();

    for (singular, resource, group, _version, namespaced) in WELL_KNOWN_KINDS {
        let mut query = CapabilityQuery::new("list", *group, *resource);
        if *namespaced {
            if let Some(ns) = namespace {
                query = query.with_namespace(ns);
            }
        }
        if capability.can(&query).await {
            enabled.insert((*singular).to_string());
        } else {
            restricted.insert((*singular).to_string());
        }
    }

    (enabled, restricted)
}

fn classify_error(err: &EngineError) -> ConnectionErrorType {
    match err {
        EngineError::Kube(kube_err) => ConnectionErrorType::from(classify_kube_error(kube_err)),
        EngineError::Auth { .. } => ConnectionErrorType::Auth,
        EngineError::Network { .. } => ConnectionErrorType::Network,
        EngineError::Timeout { .. } => ConnectionErrorType::Timeout,
        _ => ConnectionErrorType::Unknown,
    }
}

/// Drains the Change Channel, routing each notification to the timeline
/// store and the broadcaster. Native `Event` objects get their controller
/// owner resolved via the typed cache before being recorded (§4.5).
async fn dispatch_loop(
    rx: &mut mpsc::Receiver<ChangeEvent>,
    timeline: Arc<TimelineStore>,
    broadcaster: Arc<Broadcaster>,
    typed_cache: Arc<TypedCache>,
) {
    while let Some(event) = rx.recv().await {
        if event.resource.kind == "Event" {
            let owner = resolve_event_owner(&event, &typed_cache).await;
            if event.change != ChangeKind::Deleted {
                let timeline_event = timeline.record_k8s_event(&event.snapshot, owner, event.observed_at).await;
                broadcaster.publish_timeline(timeline_event).await;
            }
            broadcaster.publish_change(event).await;
            continue;
        }

        let recorded = timeline.record_change(&event).await;
        for timeline_event in recorded {
            broadcaster.publish_timeline(timeline_event).await;
        }
        broadcaster.publish_change(event).await;
    }
}

/// Resolves a native `Event`'s involved object to its controller owner by
/// looking the involved object up in the typed cache (§4.5 "special handler").
async fn resolve_event_owner(event: &ChangeEvent, typed_cache: &TypedCache) -> Option<(String, String)> {
    let involved = event.snapshot.data.get("involvedObject")?;
    let kind = involved.get("kind")?.as_str()?;
    let name = involved.get("name")?.as_str()?;
    let namespace = involved.get("namespace").and_then(|v| v.as_str());

    let snapshot = typed_cache.get(kind, namespace, name).await?;
    snapshot.owner
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_class_maps_onto_connection_error_type() {
        assert_eq!(ConnectionErrorType::from(ErrorClass::Auth), ConnectionErrorType::Auth);
        assert_eq!(ConnectionErrorType::from(ErrorClass::Timeout), ConnectionErrorType::Timeout);
    }

    #[test]
    fn connection_status_constructors_set_expected_state() {
        let connecting = ConnectionStatus::connecting(Some("dev".to_string()), "probing");
        assert_eq!(connecting.state, ConnectionState::Connecting);
        assert_eq!(connecting.progress.as_deref(), Some("probing"));

        let connected = ConnectionStatus::connected(Some("dev".to_string()));
        assert_eq!(connected.state, ConnectionState::Connected);
        assert!(connected.error.is_none());

        let failed = ConnectionStatus::failed(None, "boom".to_string(), ConnectionErrorType::Network);
        assert_eq!(failed.state, ConnectionState::Disconnected);
        assert_eq!(failed.error_type, Some(ConnectionErrorType::Network));
    }
}
