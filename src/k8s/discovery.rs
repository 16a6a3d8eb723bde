//! API Resource Discovery (C2, §4.2): maps kind names the user or the UI
//! supplies onto concrete GVRs, and exposes the capability metadata
//! (namespaced scope, supported verbs, CRD-provenance) needed by the rest of
//! the engine. Built on top of `kube::discovery::Discovery` rather than
//! re-querying `/apis` and `/api` directly — that type already does the
//! group/version enumeration and preferred-version bookkeeping we need.

use std::collections::HashMap;
use std::sync::RwLock;

use kube::discovery::{verbs, Discovery as KubeDiscovery};
use kube::Client;

use crate::errors::{EngineError, EngineResult};
use super::kind::{ApiResourceDescriptor, Gvr};

/// Built-in API groups shipped by Kubernetes itself. Anything else is
/// treated as CRD-provided (§4.2 `is_crd` derivation): there is no direct
/// "this came from a CustomResourceDefinition" bit on the discovery types
/// `kube` hands back, so group membership is the next best signal.
const BUILTIN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "autoscaling",
    "networking.k8s.io",
    "policy",
    "rbac.authorization.k8s.io",
    "storage.k8s.io",
    "apiextensions.k8s.io",
    "apiregistration.k8s.io",
    "admissionregistration.k8s.io",
    "authentication.k8s.io",
    "authorization.k8s.io",
    "certificates.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "events.k8s.io",
    "node.k8s.io",
    "scheduling.k8s.io",
    "flowcontrol.apiserver.k8s.io",
];

fn is_crd_group(group: &str) -> bool {
    !BUILTIN_GROUPS.contains(&group)
}

#[derive(Default)]
struct DiscoveryState {
    descriptors: HashMap<Gvr, ApiResourceDescriptor>,
    /// Lowercased singular kind -> candidate GVRs, for disambiguation when a
    /// kind name collides across groups.
    by_kind: HashMap<String, Vec<Gvr>>,
    /// Lowercased plural resource name -> candidate GVRs.
    by_resource: HashMap<String, Vec<Gvr>>,
}

/// Caching wrapper around `kube::discovery::Discovery`. One instance is
/// shared by the typed and dynamic caches; `refresh` is called at startup
/// and whenever a CRD is suspected to have appeared (§4.2, §4.4).
pub struct ApiDiscovery {
    client: Client,
    state: RwLock<DiscoveryState>,
}

impl ApiDiscovery {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            state: RwLock::new(DiscoveryState::default()),
        }
    }

    /// Re-runs discovery against the cluster and replaces the cached index
    /// wholesale. Errors surface as `EngineError::Kube`; callers that treat
    /// discovery as best-effort (CRD re-scan) should log and continue rather
    /// than propagate.
    pub async fn refresh(&self) -> EngineResult<()> {
        let discovery = KubeDiscovery::new(self.client.clone()).run().await?;

        let mut descriptors = HashMap::new();
        let mut by_kind: HashMap<String, Vec<Gvr>> = HashMap::new();
        let mut by_resource: HashMap<String, Vec<Gvr>> = HashMap::new();

        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let gvr = Gvr::new(ar.group.clone(), ar.version.clone(), ar.plural.clone());
                let descriptor = ApiResourceDescriptor {
                    gvr: gvr.clone(),
                    singular_kind: ar.kind.clone(),
                    namespaced: matches!(caps.scope, kube::discovery::Scope::Namespaced),
                    verbs: caps.operations.clone(),
                    is_crd: is_crd_group(&ar.group),
                };

                by_kind
                    .entry(ar.kind.to_ascii_lowercase())
                    .or_default()
                    .push(gvr.clone());
                by_resource
                    .entry(ar.plural.to_ascii_lowercase())
                    .or_default()
                    .push(gvr.clone());

                descriptors.insert(gvr, descriptor);
            }
        }

        let mut state = self.state.write().expect("discovery lock poisoned");
        state.descriptors = descriptors;
        state.by_kind = by_kind;
        state.by_resource = by_resource;
        Ok(())
    }

    /// Resolves a bare kind or resource name (case-insensitive) to a GVR.
    /// Returns `AmbiguousKind` when the name is served by more than one
    /// group and the caller hasn't disambiguated (§4.2).
    pub fn resolve_kind(&self, kind: &str) -> Result<Gvr, EngineError> {
        let key = kind.to_ascii_lowercase();
        let state = self.state.read().expect("discovery lock poisoned");

        let candidates = state
            .by_kind
            .get(&key)
            .or_else(|| state.by_resource.get(&key))
            .ok_or_else(|| EngineError::UnknownKind { kind: kind.to_string() })?;

        match candidates.as_slice() {
            [] => Err(EngineError::UnknownKind { kind: kind.to_string() }),
            [single] => Ok(single.clone()),
            many => Err(EngineError::AmbiguousKind {
                kind: kind.to_string(),
                groups: many.iter().map(|g| g.group.clone()).collect(),
            }),
        }
    }

    /// Resolves `(kind, group)` unambiguously, for callers that already
    /// know which provider they mean (§4.2 disambiguation).
    pub fn resolve_kind_in_group(&self, kind: &str, group: &str) -> Result<Gvr, EngineError> {
        let key = kind.to_ascii_lowercase();
        let state = self.state.read().expect("discovery lock poisoned");
        state
            .by_kind
            .get(&key)
            .into_iter()
            .flatten()
            .chain(state.by_resource.get(&key).into_iter().flatten())
            .find(|gvr| gvr.group == group)
            .cloned()
            .ok_or_else(|| EngineError::UnknownKind { kind: kind.to_string() })
    }

    pub fn descriptor(&self, gvr: &Gvr) -> Option<ApiResourceDescriptor> {
        self.state
            .read()
            .expect("discovery lock poisoned")
            .descriptors
            .get(gvr)
            .cloned()
    }

    pub fn singular_kind(&self, gvr: &Gvr) -> Option<String> {
        self.descriptor(gvr).map(|d| d.singular_kind)
    }

    pub fn supports_watch(&self, gvr: &Gvr) -> bool {
        self.descriptor(gvr)
            .map(|d| d.supports_watch())
            .unwrap_or(false)
    }

    pub fn is_namespaced(&self, gvr: &Gvr) -> Option<bool> {
        self.descriptor(gvr).map(|d| d.namespaced)
    }

    /// All descriptors currently known, for CRD-sweep warmup (§4.4) and
    /// diagnostics endpoints.
    pub fn all_descriptors(&self) -> Vec<ApiResourceDescriptor> {
        self.state
            .read()
            .expect("discovery lock poisoned")
            .descriptors
            .values()
            .cloned()
            .collect()
    }

    pub fn crd_descriptors(&self) -> Vec<ApiResourceDescriptor> {
        self.all_descriptors().into_iter().filter(|d| d.is_crd).collect()
    }
}

/// Version-preference ordinal used when more than one version of a group is
/// served and no explicit preference is reported: stable > beta > alpha,
/// then by major/minor within a track (§4.2). `kube::discovery::ApiGroup`
/// already applies its own ordering via `recommended_resources`; this is
/// exposed separately for callers building their own sort (e.g. UI version
/// pickers) against raw version strings.
pub fn version_track_ordinal(version: &str) -> (u8, u32, u32) {
    let (track, rest) = if let Some(rest) = version.strip_prefix('v') {
        (3u8, rest)
    } else {
        return (0, 0, 0);
    };

    let (track, rest) = if let Some(idx) = rest.find("alpha") {
        (1u8, (&rest[..idx], &rest[idx + "alpha".len()..]))
    } else if let Some(idx) = rest.find("beta") {
        (2u8, (&rest[..idx], &rest[idx + "beta".len()..]))
    } else {
        (track, (rest, ""))
    };

    let major: u32 = rest.0.parse().unwrap_or(0);
    let minor: u32 = rest.1.parse().unwrap_or(0);
    (track, major, minor)
}

pub fn supports_verb(verbs_list: &[String], verb: &str) -> bool {
    verbs_list.iter().any(|v| v == verb) || verb == verbs::WATCH && verbs_list.iter().any(|v| v == "watch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_groups_are_not_crds() {
        assert!(!is_crd_group(""));
        assert!(!is_crd_group("apps"));
        assert!(!is_crd_group("networking.k8s.io"));
    }

    #[test]
    fn unrecognized_groups_are_crds() {
        assert!(is_crd_group("argoproj.io"));
        assert!(is_crd_group("cert-manager.io"));
    }

    #[test]
    fn version_ordinal_ranks_stable_above_beta_above_alpha() {
        assert!(version_track_ordinal("v1") > version_track_ordinal("v1beta1"));
        assert!(version_track_ordinal("v1beta1") > version_track_ordinal("v1alpha1"));
        assert!(version_track_ordinal("v2") > version_track_ordinal("v1"));
    }

    #[test]
    fn version_ordinal_handles_minor_within_track() {
        assert!(version_track_ordinal("v1beta2") > version_track_ordinal("v1beta1"));
    }
}
