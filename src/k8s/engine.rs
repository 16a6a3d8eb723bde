//! The top-level `Engine`: the single process-wide handle collaborators
//! bind to (§5 "Global singletons", §6 "Exposed"). Wraps one
//! `ConnectionController` behind a lock so `switch_context`/`reset_all` can
//! swap the whole subsystem set atomically without invalidating handles
//! already handed to callers — they hold `Arc<Engine>`, not
//! `Arc<ConnectionController>`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::config::Config;
use crate::errors::{EngineError, EngineResult};

use super::broadcast::{Broadcaster, SubscriberMessage, Subscription};
use super::capability::CapabilityQuery;
use super::connection::{CollaboratorHooks, ConnectionController, ConnectionStatus};
use super::discovery::ApiDiscovery;
use super::dynamic_cache::ensure_watching_by_kind;
use super::kind::well_known_gvr;
use super::snapshot::ResourceSnapshot;
use super::system_monitor::{system_diagnostics, SystemDiagnostics};
use super::timeline::{QueryOptions, TimelineEvent, TimelineMetrics};

/// Workload-aware status summary (§6 `status_of`).
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub status: String,
    pub ready_string: String,
    pub message: Option<String>,
    pub summary: Option<String>,
    pub issue: Option<String>,
}

/// Feature gates derived from the sentinel capability probes plus per-kind
/// list access, surfaced to collaborators so they can hide affordances the
/// current identity cannot use (§4.1, §6 `capabilities()`).
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub exec: bool,
    pub logs: bool,
    pub portforward: bool,
    pub secrets: bool,
    pub helm_write: bool,
    pub resources: HashMap<String, bool>,
}

/// One entry in the Read API's kind catalog (A.6 "Resource categorization"):
/// a discovered kind, labeled with its category and whether the current
/// identity can list/watch it.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub kind: String,
    pub group: String,
    pub category: &'static str,
    pub is_crd: bool,
    pub accessible: bool,
}

/// Per-kind object counts plus the restricted-kind roster (§7
/// "forbidden_per_kind", P10): `restricted` lists kinds C1 denied access to,
/// flattened alongside the per-kind counts so `cluster_info.counts.restricted`
/// is reachable the way §7/P10 name it.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterCounts {
    #[serde(flatten)]
    pub by_kind: HashMap<String, usize>,
    pub restricted: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    pub context: Option<String>,
    pub cluster: Option<String>,
    pub platform: String,
    pub k8s_version: Option<String>,
    pub counts: ClusterCounts,
    pub in_cluster: bool,
    pub crd_discovery_status: String,
}

/// Process-wide engine handle. `Init` is `Engine::start`; `Reset` is
/// `reset_all` (§5 "each has explicit Init/Reset entry points").
pub struct Engine {
    base_config: Config,
    broadcaster: Arc<Broadcaster>,
    hooks: CollaboratorHooks,
    controller: RwLock<Arc<ConnectionController>>,
}

impl Engine {
    /// `Init`: builds the broadcaster and runs the first connection startup
    /// sequence against whatever context the configuration resolves to.
    pub async fn start(config: Config, hooks: CollaboratorHooks) -> EngineResult<Arc<Self>> {
        let broadcaster = Arc::new(Broadcaster::new(config.subscriber_buffer_capacity));
        let controller =
            ConnectionController::connect(config.clone(), None, broadcaster.clone(), hooks.clone()).await?;
        Ok(Arc::new(Self {
            base_config: config,
            broadcaster,
            hooks,
            controller: RwLock::new(controller),
        }))
    }

    async fn controller(&self) -> Arc<ConnectionController> {
        self.controller.read().await.clone()
    }

    // ---- Read API (§6) ----------------------------------------------

    /// `list(kind, namespaces?) -> [resource]`: the typed cache path when
    /// `kind` is one of the sixteen well-known kinds, the dynamic cache path
    /// (ensuring a watch is running first) otherwise.
    pub async fn list(&self, kind: &str, namespaces: &[String]) -> EngineResult<Vec<ResourceSnapshot>> {
        let controller = self.controller().await;

        if well_known_gvr(kind).is_some() {
            return Ok(list_from(namespaces, |ns| {
                let typed_cache = controller.typed_cache.clone();
                let kind = kind.to_string();
                async move { typed_cache.list(&kind, ns.as_deref()).await }
            })
            .await);
        }

        let gvr = ensure_watching_by_kind(&controller.dynamic_cache, &controller.discovery, kind).await?;
        Ok(list_from(namespaces, |ns| {
            let dynamic_cache = controller.dynamic_cache.clone();
            let gvr = gvr.clone();
            async move { dynamic_cache.list_blocking(&gvr, ns.as_deref()).await }
        })
        .await)
    }

    /// `get(kind, namespace, name, group?) -> resource`.
    pub async fn get(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        group: Option<&str>,
    ) -> EngineResult<ResourceSnapshot> {
        let controller = self.controller().await;

        if group.is_none() {
            if let Some(snapshot) = controller.typed_cache.get(kind, namespace, name).await {
                return Ok(snapshot);
            }
        }

        let gvr = match group {
            Some(group) => controller.discovery.resolve_kind_in_group(kind, group)?,
            None => controller.discovery.resolve_kind(kind)?,
        };
        controller.dynamic_cache.ensure_watching(gvr.clone()).await?;
        controller
            .dynamic_cache
            .get(&gvr, namespace, name)
            .await
            .ok_or_else(|| EngineError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
            })
    }

    /// Workload-aware status derived from the object body (§6 `status_of`).
    pub async fn status_of(&self, kind: &str, namespace: &str, name: &str) -> EngineResult<StatusSummary> {
        let snapshot = self.get(kind, Some(namespace), name, None).await?;
        Ok(derive_status(kind, &snapshot))
    }

    pub async fn capabilities(&self) -> Capabilities {
        let controller = self.controller().await;
        let namespace = self.base_config.namespace.as_deref();

        let exec = controller.capability.can_exec_pods(namespace).await;
        let secrets = controller.capability.can_create_secrets(namespace).await;
        let logs = controller
            .capability
            .can(&CapabilityQuery::new("get", "", "pods").with_subresource("log"))
            .await;
        let portforward = controller
            .capability
            .can(&CapabilityQuery::new("create", "", "pods").with_subresource("portforward"))
            .await;

        let mut resources = HashMap::new();
        for kind in controller.restricted_kinds().await {
            resources.insert(kind, false);
        }
        for (singular, ..) in super::kind::WELL_KNOWN_KINDS {
            resources.entry((*singular).to_string()).or_insert(true);
        }

        Capabilities {
            exec,
            logs,
            portforward,
            secrets,
            helm_write: false,
            resources,
        }
    }

    pub async fn cluster_info(&self) -> EngineResult<ClusterInfo> {
        let controller = self.controller().await;
        let client = controller.client.get_client().await?;
        let k8s_version = client.apiserver_version().await.ok().map(|info| info.git_version);

        let restricted = controller.restricted_kinds().await;
        let mut by_kind = HashMap::new();
        for (singular, ..) in super::kind::WELL_KNOWN_KINDS {
            if restricted.iter().any(|r| r == singular) {
                continue;
            }
            let count = controller.typed_cache.list(singular, None).await.len();
            if count > 0 {
                by_kind.insert((*singular).to_string(), count);
            }
        }

        Ok(ClusterInfo {
            context: controller.context_name.clone(),
            cluster: None,
            platform: std::env::consts::OS.to_string(),
            k8s_version,
            counts: ClusterCounts { by_kind, restricted },
            in_cluster: controller.context_name.is_none() && self.base_config.kubeconfig.is_none(),
            crd_discovery_status: format!("{} resource types known", controller.discovery.all_descriptors().len()),
        })
    }

    pub fn diagnostics(&self) -> SystemDiagnostics {
        system_diagnostics()
    }

    /// `resource_catalog()` (A.6): the kind catalog grouped by category,
    /// generalized from the donor's static `get_resource_categories()` list
    /// to describe the actual C1/C2-gated set for the currently connected
    /// cluster rather than a fixed roster.
    pub async fn resource_catalog(&self) -> Vec<CatalogEntry> {
        let controller = self.controller().await;
        let restricted = controller.restricted_kinds().await;

        let mut catalog: Vec<CatalogEntry> = super::kind::WELL_KNOWN_KINDS
            .iter()
            .map(|(kind, _resource, group, _version, _namespaced)| CatalogEntry {
                kind: (*kind).to_string(),
                group: (*group).to_string(),
                category: super::kind::categorize(kind, group, false).label(),
                is_crd: false,
                accessible: !restricted.iter().any(|r| r == kind),
            })
            .collect();

        for descriptor in controller.discovery.crd_descriptors() {
            catalog.push(CatalogEntry {
                kind: descriptor.singular_kind.clone(),
                group: descriptor.gvr.group.clone(),
                category: super::kind::categorize(&descriptor.singular_kind, &descriptor.gvr.group, true).label(),
                is_crd: true,
                accessible: descriptor.supports_watch(),
            });
        }

        catalog
    }

    // ---- Timeline pass-throughs (§6) --------------------------------

    pub async fn timeline_query(&self, options: &QueryOptions) -> Vec<TimelineEvent> {
        self.controller().await.timeline.query(options).await
    }

    pub async fn timeline_changes_for_owner(
        &self,
        owner_kind: &str,
        owner_namespace: &str,
        owner_name: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
        limit: usize,
    ) -> Vec<TimelineEvent> {
        self.controller()
            .await
            .timeline
            .changes_for_owner(owner_kind, owner_namespace, owner_name, since, limit)
            .await
    }

    pub async fn timeline_debug_metrics(&self) -> TimelineMetrics {
        self.controller().await.timeline.debug_metrics().await
    }

    // ---- Subscription API (§6) --------------------------------------

    pub async fn subscribe(&self) -> (mpsc::Receiver<SubscriberMessage>, Subscription) {
        self.broadcaster.subscribe().await
    }

    // ---- Control API (§6) --------------------------------------------

    /// `switch_context(name)`: tears down the active connection and builds a
    /// fresh one against the named context, swapping it in atomically
    /// (§4.9, §9, S5). Subscribers are not torn down — they keep their
    /// streams and simply start receiving notifications from the new
    /// connection once it reaches `connected`.
    pub async fn switch_context(&self, name: &str) -> EngineResult<()> {
        let mut guard = self.controller.write().await;
        guard.disconnect().await;

        let fresh = ConnectionController::connect(
            self.base_config.clone(),
            Some(name.to_string()),
            self.broadcaster.clone(),
            self.hooks.clone(),
        )
        .await?;
        *guard = fresh;
        Ok(())
    }

    /// `retry_connection()`: re-runs the startup sequence against whatever
    /// context is currently configured, without changing it.
    pub async fn retry_connection(&self) -> EngineResult<()> {
        let mut guard = self.controller.write().await;
        let context_name = guard.context_name.clone();
        guard.disconnect().await;

        let fresh = ConnectionController::connect(
            self.base_config.clone(),
            context_name,
            self.broadcaster.clone(),
            self.hooks.clone(),
        )
        .await?;
        *guard = fresh;
        Ok(())
    }

    /// `invalidate_capabilities()`: forces the next probe of every sentinel
    /// and per-kind capability to re-query the cluster (§4.1).
    pub async fn invalidate_capabilities(&self) {
        self.controller().await.capability.invalidate();
    }

    /// `reset_all()`: the `Reset` entry point for every global singleton
    /// (§5). Equivalent to `retry_connection` plus clearing the broadcaster's
    /// cached topology snapshot and disconnecting every current subscriber.
    pub async fn reset_all(&self) -> EngineResult<()> {
        self.broadcaster.teardown().await;
        self.retry_connection().await
    }

    pub async fn discovery(&self) -> Arc<ApiDiscovery> {
        self.controller().await.discovery.clone()
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.controller().await.status().await
    }
}

/// Runs `op` once per requested namespace (or once, unscoped, when the list
/// is empty — "all namespaces") and flattens the results.
async fn list_from<F, Fut>(namespaces: &[String], op: F) -> Vec<ResourceSnapshot>
where
    F: Fn(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Vec<ResourceSnapshot>>,
{
    if namespaces.is_empty() {
        return op(None).await;
    }
    let mut out = Vec::new();
    for ns in namespaces {
        out.extend(op(Some(ns.clone())).await);
    }
    out
}

/// Heuristic workload-status derivation from a snapshot's raw body, covering
/// the kinds §6 calls out by name. Unrecognized kinds fall back to a generic
/// "present" status rather than failing the call.
fn derive_status(kind: &str, snapshot: &ResourceSnapshot) -> StatusSummary {
    let data = &snapshot.data;
    match kind {
        "Pod" => {
            let phase = data
                .get("status")
                .and_then(|s| s.get("phase"))
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown");
            let containers = data
                .get("status")
                .and_then(|s| s.get("containerStatuses"))
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let ready = containers.iter().filter(|c| c.get("ready").and_then(|v| v.as_bool()).unwrap_or(false)).count();
            let total = containers.len();
            let issue = containers.iter().find_map(|c| {
                c.get("state")
                    .and_then(|s| s.get("waiting"))
                    .and_then(|w| w.get("reason"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            });
            StatusSummary {
                status: phase.to_string(),
                ready_string: format!("{ready}/{total}"),
                message: None,
                summary: Some(format!("{phase}, {ready}/{total} containers ready")),
                issue,
            }
        }
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" => {
            let spec_replicas = data.get("spec").and_then(|s| s.get("replicas")).and_then(|v| v.as_i64()).unwrap_or(0);
            let ready_replicas = data.get("status").and_then(|s| s.get("readyReplicas")).and_then(|v| v.as_i64()).unwrap_or(0);
            let status = if ready_replicas >= spec_replicas && spec_replicas > 0 {
                "Available"
            } else {
                "Progressing"
            };
            StatusSummary {
                status: status.to_string(),
                ready_string: format!("{ready_replicas}/{spec_replicas}"),
                message: None,
                summary: Some(format!("{ready_replicas}/{spec_replicas} replicas ready")),
                issue: None,
            }
        }
        "Job" => {
            let succeeded = data.get("status").and_then(|s| s.get("succeeded")).and_then(|v| v.as_i64()).unwrap_or(0);
            let failed = data.get("status").and_then(|s| s.get("failed")).and_then(|v| v.as_i64()).unwrap_or(0);
            let status = if failed > 0 {
                "Failed"
            } else if succeeded > 0 {
                "Complete"
            } else {
                "Running"
            };
            StatusSummary {
                status: status.to_string(),
                ready_string: format!("{succeeded} succeeded"),
                message: None,
                summary: None,
                issue: (failed > 0).then(|| format!("{failed} failed")),
            }
        }
        "CronJob" => StatusSummary {
            status: "Scheduled".to_string(),
            ready_string: String::new(),
            message: data.get("spec").and_then(|s| s.get("schedule")).and_then(|v| v.as_str()).map(str::to_string),
            summary: None,
            issue: None,
        },
        "HorizontalPodAutoscaler" => {
            let current = data.get("status").and_then(|s| s.get("currentReplicas")).and_then(|v| v.as_i64()).unwrap_or(0);
            let desired = data.get("status").and_then(|s| s.get("desiredReplicas")).and_then(|v| v.as_i64()).unwrap_or(0);
            let min = data.get("spec").and_then(|s| s.get("minReplicas")).and_then(|v| v.as_i64());
            let max = data.get("spec").and_then(|s| s.get("maxReplicas")).and_then(|v| v.as_i64());
            let status = if current < desired { "Scaling" } else { "Stable" };
            StatusSummary {
                status: status.to_string(),
                ready_string: format!("{current}/{desired}"),
                message: None,
                summary: Some(format!(
                    "{current}/{desired} replicas ({}-{})",
                    min.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string()),
                    max.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string())
                )),
                issue: None,
            }
        }
        "PersistentVolumeClaim" => {
            let phase = data.get("status").and_then(|s| s.get("phase")).and_then(|v| v.as_str()).unwrap_or("Unknown");
            let capacity = data
                .get("status")
                .and_then(|s| s.get("capacity"))
                .and_then(|c| c.get("storage"))
                .and_then(|v| v.as_str());
            StatusSummary {
                status: phase.to_string(),
                ready_string: phase.to_string(),
                message: capacity.map(str::to_string),
                summary: capacity.map(|c| format!("{phase}, {c}")),
                issue: (phase != "Bound").then(|| phase.to_string()),
            }
        }
        "Service" => {
            let svc_type = data.get("spec").and_then(|s| s.get("type")).and_then(|v| v.as_str()).unwrap_or("ClusterIP");
            let lb_ingress = data
                .get("status")
                .and_then(|s| s.get("loadBalancer"))
                .and_then(|lb| lb.get("ingress"))
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
                .and_then(|entry| entry.get("ip").or_else(|| entry.get("hostname")))
                .and_then(|v| v.as_str());
            let issue = (svc_type == "LoadBalancer" && lb_ingress.is_none()).then(|| "load balancer pending".to_string());
            StatusSummary {
                status: svc_type.to_string(),
                ready_string: lb_ingress.unwrap_or("-").to_string(),
                message: lb_ingress.map(str::to_string),
                summary: Some(match lb_ingress {
                    Some(addr) => format!("{svc_type} at {addr}"),
                    None => svc_type.to_string(),
                }),
                issue,
            }
        }
        "Ingress" => {
            let addresses: Vec<String> = data
                .get("status")
                .and_then(|s| s.get("loadBalancer"))
                .and_then(|lb| lb.get("ingress"))
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|entry| entry.get("ip").or_else(|| entry.get("hostname")))
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let status = if addresses.is_empty() { "Pending" } else { "Routed" };
            StatusSummary {
                status: status.to_string(),
                ready_string: addresses.join(", "),
                message: None,
                summary: Some(if addresses.is_empty() {
                    "no address assigned".to_string()
                } else {
                    format!("routed via {}", addresses.join(", "))
                }),
                issue: addresses.is_empty().then(|| "no address assigned".to_string()),
            }
        }
        "ConfigMap" => {
            let count = data.get("data").and_then(|v| v.as_object()).map(|m| m.len()).unwrap_or(0);
            StatusSummary {
                status: "Present".to_string(),
                ready_string: format!("{count} key(s)"),
                message: None,
                summary: Some(format!("{count} data key(s)")),
                issue: None,
            }
        }
        "Secret" => {
            let secret_type = data.get("type").and_then(|v| v.as_str()).unwrap_or("Opaque");
            let count = data.get("data").and_then(|v| v.as_object()).map(|m| m.len()).unwrap_or(0);
            StatusSummary {
                status: secret_type.to_string(),
                ready_string: format!("{count} key(s)"),
                message: None,
                summary: Some(format!("{secret_type}, {count} data key(s)")),
                issue: None,
            }
        }
        _ => StatusSummary {
            status: "Present".to_string(),
            ready_string: String::new(),
            message: None,
            summary: None,
            issue: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn snapshot(data: serde_json::Value) -> ResourceSnapshot {
        ResourceSnapshot {
            kind: "Pod".to_string(),
            namespace: Some("default".to_string()),
            name: "p".to_string(),
            uid: "u".to_string(),
            resource_version: None,
            creation_timestamp: None,
            labels: BTreeMap::new(),
            owner: None,
            data,
        }
    }

    #[test]
    fn pod_status_reports_ready_count() {
        let snap = snapshot(json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [{"ready": true}, {"ready": false}]
            }
        }));
        let status = derive_status("Pod", &snap);
        assert_eq!(status.status, "Running");
        assert_eq!(status.ready_string, "1/2");
    }

    #[test]
    fn deployment_status_reports_availability() {
        let snap = snapshot(json!({
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 3}
        }));
        let status = derive_status("Deployment", &snap);
        assert_eq!(status.status, "Available");
        assert_eq!(status.ready_string, "3/3");
    }

    #[test]
    fn job_status_flags_failure_as_issue() {
        let snap = snapshot(json!({"status": {"failed": 1}}));
        let status = derive_status("Job", &snap);
        assert_eq!(status.status, "Failed");
        assert_eq!(status.issue.as_deref(), Some("1 failed"));
    }

    #[test]
    fn unrecognized_kind_falls_back_to_present() {
        let snap = snapshot(json!({}));
        let status = derive_status("Widget", &snap);
        assert_eq!(status.status, "Present");
    }

    #[test]
    fn hpa_status_reports_current_and_desired() {
        let snap = snapshot(json!({
            "spec": {"minReplicas": 1, "maxReplicas": 10},
            "status": {"currentReplicas": 2, "desiredReplicas": 4}
        }));
        let status = derive_status("HorizontalPodAutoscaler", &snap);
        assert_eq!(status.status, "Scaling");
        assert_eq!(status.ready_string, "2/4");
    }

    #[test]
    fn pvc_status_reports_phase_and_capacity() {
        let snap = snapshot(json!({
            "status": {"phase": "Bound", "capacity": {"storage": "10Gi"}}
        }));
        let status = derive_status("PersistentVolumeClaim", &snap);
        assert_eq!(status.status, "Bound");
        assert!(status.issue.is_none());
    }

    #[test]
    fn pvc_status_flags_unbound_as_issue() {
        let snap = snapshot(json!({"status": {"phase": "Pending"}}));
        let status = derive_status("PersistentVolumeClaim", &snap);
        assert_eq!(status.issue.as_deref(), Some("Pending"));
    }

    #[test]
    fn service_status_flags_pending_load_balancer() {
        let snap = snapshot(json!({"spec": {"type": "LoadBalancer"}}));
        let status = derive_status("Service", &snap);
        assert_eq!(status.status, "LoadBalancer");
        assert_eq!(status.issue.as_deref(), Some("load balancer pending"));
    }

    #[test]
    fn service_status_reports_load_balancer_address() {
        let snap = snapshot(json!({
            "spec": {"type": "LoadBalancer"},
            "status": {"loadBalancer": {"ingress": [{"ip": "1.2.3.4"}]}}
        }));
        let status = derive_status("Service", &snap);
        assert!(status.issue.is_none());
        assert_eq!(status.ready_string, "1.2.3.4");
    }

    #[test]
    fn ingress_status_reports_routed_address() {
        let snap = snapshot(json!({
            "status": {"loadBalancer": {"ingress": [{"hostname": "example.com"}]}}
        }));
        let status = derive_status("Ingress", &snap);
        assert_eq!(status.status, "Routed");
        assert_eq!(status.ready_string, "example.com");
    }

    #[test]
    fn configmap_status_reports_key_count() {
        let snap = snapshot(json!({"data": {"a": "1", "b": "2"}}));
        let status = derive_status("ConfigMap", &snap);
        assert_eq!(status.ready_string, "2 key(s)");
    }

    #[test]
    fn secret_status_reports_type_and_key_count() {
        let snap = snapshot(json!({"type": "kubernetes.io/tls", "data": {"tls.crt": "x"}}));
        let status = derive_status("Secret", &snap);
        assert_eq!(status.status, "kubernetes.io/tls");
        assert_eq!(status.ready_string, "1 key(s)");
    }
}
