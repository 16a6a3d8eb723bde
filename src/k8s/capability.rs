//! Capability Prober (C1, §4.1): answers "can the current identity do X"
//! via `SelfSubjectAccessReview`, fail-closed, with a short-lived cache so
//! the UI can poll feature gates without hammering the API server.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::Client;

use crate::errors::EngineResult;

/// The `(verb, group, resource, subresource, namespace)` key a probe is
/// cached under. `namespace: None` means a cluster-scoped check (§4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityQuery {
    pub verb: String,
    pub group: String,
    pub resource: String,
    pub subresource: Option<String>,
    pub namespace: Option<String>,
}

impl CapabilityQuery {
    pub fn new(verb: impl Into<String>, group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            group: group.into(),
            resource: resource.into(),
            subresource: None,
            namespace: None,
        }
    }

    pub fn with_subresource(mut self, subresource: impl Into<String>) -> Self {
        self.subresource = Some(subresource.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

struct CachedAnswer {
    allowed: bool,
    checked_at: Instant,
}

/// Sentinel probes the UI polls at startup to toggle feature affordances
/// (§4.1): pod exec and secret creation are the two the spec calls out by
/// name, since both gate destructive or sensitive actions.
pub const SENTINEL_PODS_EXEC: &str = "pods/exec:create";
pub const SENTINEL_SECRETS_CREATE: &str = "secrets:create";

pub struct CapabilityProber {
    client: Client,
    ttl: Duration,
    cache: RwLock<HashMap<CapabilityQuery, CachedAnswer>>,
}

impl CapabilityProber {
    pub fn new(client: Client, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Answers a capability query, consulting the cache first. On any
    /// transport or auth error the probe is treated as denied (§4.1
    /// fail-closed) rather than propagated, since a capability check backs a
    /// UI affordance decision, not a user-initiated action.
    pub async fn can(&self, query: &CapabilityQuery) -> bool {
        if let Some(cached) = self.cached(query) {
            return cached;
        }
        let allowed = self.probe(query).await.unwrap_or(false);
        self.cache
            .write()
            .expect("capability cache lock poisoned")
            .insert(
                query.clone(),
                CachedAnswer {
                    allowed,
                    checked_at: Instant::now(),
                },
            );
        allowed
    }

    fn cached(&self, query: &CapabilityQuery) -> Option<bool> {
        let cache = self.cache.read().expect("capability cache lock poisoned");
        let entry = cache.get(query)?;
        if entry.checked_at.elapsed() < self.ttl {
            Some(entry.allowed)
        } else {
            None
        }
    }

    /// Drops every cached answer, forcing the next `can` call to re-probe.
    /// Called when the underlying identity might have changed (reconnect,
    /// kubeconfig context switch) (§4.1).
    pub fn invalidate(&self) {
        self.cache.write().expect("capability cache lock poisoned").clear();
    }

    async fn probe(&self, query: &CapabilityQuery) -> EngineResult<bool> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let attributes = ResourceAttributes {
            group: if query.group.is_empty() {
                None
            } else {
                Some(query.group.clone())
            },
            resource: Some(query.resource.clone()),
            subresource: query.subresource.clone(),
            verb: Some(query.verb.clone()),
            namespace: query.namespace.clone(),
            ..Default::default()
        };
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(attributes),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = api.create(&PostParams::default(), &review).await?;
        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }

    /// Convenience for `pods/exec:create`, used to gate the exec affordance.
    pub async fn can_exec_pods(&self, namespace: Option<&str>) -> bool {
        let mut query = CapabilityQuery::new("create", "", "pods").with_subresource("exec");
        if let Some(ns) = namespace {
            query = query.with_namespace(ns);
        }
        self.can(&query).await
    }

    /// Convenience for `secrets:create`, used to gate secret-creation UI.
    pub async fn can_create_secrets(&self, namespace: Option<&str>) -> bool {
        let mut query = CapabilityQuery::new("create", "", "secrets");
        if let Some(ns) = namespace {
            query = query.with_namespace(ns);
        }
        self.can(&query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_builder_sets_subresource_and_namespace() {
        let query = CapabilityQuery::new("create", "", "pods")
            .with_subresource("exec")
            .with_namespace("dev");
        assert_eq!(query.subresource.as_deref(), Some("exec"));
        assert_eq!(query.namespace.as_deref(), Some("dev"));
    }

    #[test]
    fn cache_expires_after_ttl() {
        let prober = CapabilityProber::new_for_test();
        let query = CapabilityQuery::new("create", "", "pods");
        prober
            .cache
            .write()
            .unwrap()
            .insert(
                query.clone(),
                CachedAnswer {
                    allowed: true,
                    checked_at: Instant::now() - Duration::from_secs(120),
                },
            );
        assert!(prober.cached(&query).is_none());
    }

    #[test]
    fn cache_hits_within_ttl() {
        let prober = CapabilityProber::new_for_test();
        let query = CapabilityQuery::new("create", "", "pods");
        prober.cache.write().unwrap().insert(
            query.clone(),
            CachedAnswer {
                allowed: true,
                checked_at: Instant::now(),
            },
        );
        assert_eq!(prober.cached(&query), Some(true));
    }

    impl CapabilityProber {
        fn new_for_test() -> Self {
            Self {
                client: Client::try_from(kube::Config::new("https://localhost:6443".parse().unwrap()))
                    .expect("test client"),
                ttl: Duration::from_secs(60),
                cache: RwLock::new(HashMap::new()),
            }
        }
    }
}
