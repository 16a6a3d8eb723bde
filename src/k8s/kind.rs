//! Kind identifiers and GVR addressing (§3 "Kind identifier").
//!
//! A resource kind is addressed by `(group, version, plural_resource,
//! singular_kind)`. The wire identifier is `(group, version, plural_resource)`;
//! `singular_kind` is the display name. Two kinds may share a singular name
//! across groups (`Application` in `argoproj.io` vs `app.k8s.io`), so lookups
//! that only have a kind name must be prepared to disambiguate by group.

use serde::{Deserialize, Serialize};

/// Group/Version/Resource: the cluster-wire identifier of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// `group/version` or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for Gvr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.resource)
    }
}

/// Everything the engine knows about one server-exposed resource type,
/// assembled by C2 (API Resource Discovery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResourceDescriptor {
    pub gvr: Gvr,
    pub singular_kind: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
    pub is_crd: bool,
}

impl ApiResourceDescriptor {
    pub fn supports_watch(&self) -> bool {
        self.verbs.iter().any(|v| v == "watch") && self.verbs.iter().any(|v| v == "list")
    }
}

/// The fixed set of 16 well-known kinds the typed cache (C3) watches
/// unconditionally, per §4.3. `(singular_kind, plural_resource, group, version, namespaced)`.
pub const WELL_KNOWN_KINDS: &[(&str, &str, &str, &str, bool)] = &[
    ("Pod", "pods", "", "v1", true),
    ("Service", "services", "", "v1", true),
    ("Deployment", "deployments", "apps", "v1", true),
    ("DaemonSet", "daemonsets", "apps", "v1", true),
    ("StatefulSet", "statefulsets", "apps", "v1", true),
    ("ReplicaSet", "replicasets", "apps", "v1", true),
    ("Ingress", "ingresses", "networking.k8s.io", "v1", true),
    ("ConfigMap", "configmaps", "", "v1", true),
    ("Secret", "secrets", "", "v1", true),
    ("Event", "events", "", "v1", true),
    ("PersistentVolumeClaim", "persistentvolumeclaims", "", "v1", true),
    ("Node", "nodes", "", "v1", false),
    ("Namespace", "namespaces", "", "v1", false),
    ("Job", "jobs", "batch", "v1", true),
    ("CronJob", "cronjobs", "batch", "v1", true),
    ("HorizontalPodAutoscaler", "horizontalpodautoscalers", "autoscaling", "v2", true),
];

pub fn well_known_gvr(singular_kind: &str) -> Option<Gvr> {
    WELL_KNOWN_KINDS
        .iter()
        .find(|(kind, ..)| *kind == singular_kind)
        .map(|(_, resource, group, version, _)| Gvr::new(*group, *version, *resource))
}

/// Resource catalog grouping (A.6 "Resource categorization for the Read
/// API's kind catalog"), generalized from the donor's static
/// `get_resource_categories()` list into a label applied to any discovered
/// kind, built-in or CRD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceCategory {
    Workloads,
    ServicesAndNetworking,
    Configuration,
    Storage,
    ClusterAdministration,
    SecurityAndAccessControl,
    Scaling,
    CustomResources,
}

impl ResourceCategory {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Workloads => "Workloads",
            Self::ServicesAndNetworking => "Services & Networking",
            Self::Configuration => "Configuration",
            Self::Storage => "Storage",
            Self::ClusterAdministration => "Cluster Administration",
            Self::SecurityAndAccessControl => "Security & Access Control",
            Self::Scaling => "Scaling",
            Self::CustomResources => "Custom Resources",
        }
    }
}

/// Categorizes a resource kind by its singular name and owning group.
/// Built-in kinds are matched by name; anything from a non-built-in group
/// (per `is_crd`) falls into `CustomResources` unless it's a well-known
/// name served under a CRD-shaped group (rare, but not impossible).
pub fn categorize(singular_kind: &str, group: &str, is_crd: bool) -> ResourceCategory {
    if is_crd {
        return ResourceCategory::CustomResources;
    }
    match singular_kind {
        "Pod" | "Deployment" | "DaemonSet" | "StatefulSet" | "ReplicaSet" | "Job" | "CronJob" => {
            ResourceCategory::Workloads
        }
        "Service" | "Ingress" | "IngressClass" | "EndpointSlice" | "Endpoints" | "NetworkPolicy" => {
            ResourceCategory::ServicesAndNetworking
        }
        "ConfigMap" | "Namespace" => ResourceCategory::Configuration,
        "Secret" => ResourceCategory::SecurityAndAccessControl,
        "PersistentVolumeClaim" | "PersistentVolume" | "StorageClass" => ResourceCategory::Storage,
        "Node" | "Event" | "Lease" | "PriorityClass" | "RuntimeClass" => ResourceCategory::ClusterAdministration,
        "Role" | "RoleBinding" | "ClusterRole" | "ClusterRoleBinding" | "ServiceAccount" => {
            ResourceCategory::SecurityAndAccessControl
        }
        "HorizontalPodAutoscaler" | "PodDisruptionBudget" => ResourceCategory::Scaling,
        _ if !group.is_empty() && group != "apps" && group != "batch" => ResourceCategory::CustomResources,
        _ => ResourceCategory::ClusterAdministration,
    }
}

/// Kinds excluded from change notifications outright (§4.5): pure
/// coordination/bookkeeping objects that churn constantly and never carry
/// information a human watching the timeline wants. `Event` is deliberately
/// *not* in this list — it is valuable history, just excluded from the
/// default live view; the timeline's `include_k8s_events` query flag
/// controls whether stored `Event` entries are returned (§4.7).
pub const ALWAYS_NOISY_KINDS: &[&str] = &["Lease", "Endpoints", "EndpointSlice"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_formats_core_group_without_slash() {
        let gvr = Gvr::new("", "v1", "pods");
        assert_eq!(gvr.api_version(), "v1");
    }

    #[test]
    fn api_version_formats_named_group_with_slash() {
        let gvr = Gvr::new("apps", "v1", "deployments");
        assert_eq!(gvr.api_version(), "apps/v1");
    }

    #[test]
    fn well_known_gvr_resolves_pod() {
        let gvr = well_known_gvr("Pod").unwrap();
        assert_eq!(gvr.resource, "pods");
        assert_eq!(gvr.group, "");
    }

    #[test]
    fn well_known_kinds_has_exactly_sixteen_entries() {
        assert_eq!(WELL_KNOWN_KINDS.len(), 16);
    }

    #[test]
    fn categorize_groups_builtin_kinds() {
        assert_eq!(categorize("Pod", "", false), ResourceCategory::Workloads);
        assert_eq!(categorize("Secret", "", false), ResourceCategory::SecurityAndAccessControl);
        assert_eq!(categorize("HorizontalPodAutoscaler", "autoscaling", false), ResourceCategory::Scaling);
        assert_eq!(categorize("PersistentVolumeClaim", "", false), ResourceCategory::Storage);
    }

    #[test]
    fn categorize_puts_crds_in_custom_resources() {
        assert_eq!(categorize("Application", "argoproj.io", true), ResourceCategory::CustomResources);
    }
}
