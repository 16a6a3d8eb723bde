//! The shared "resource snapshot" representation (§3 "Resource snapshot").
//!
//! Both the typed cache (C3) and the dynamic cache (C4) store objects as the
//! same loosely-typed tree once ingested: a concrete k8s-openapi struct for a
//! well-known kind still gets serialized into this shape at ingress so the
//! diff engine (C6), timeline store (C7) and change channel (C5) operate on
//! one representation regardless of origin (§9 "Dynamic typing of unstructured
//! objects").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `(kind_singular, namespace, name, uid)` — identifies one observed instance (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
}

impl ResourceRef {
    /// The `(kind, namespace, name)` triple used by the timeline's `seen` set;
    /// deliberately excludes `uid` since recreation under the same name must
    /// still match against the prior marker (§3 invariants).
    pub fn identity_key(&self) -> (String, Option<String>, String) {
        (self.kind.clone(), self.namespace.clone(), self.name.clone())
    }
}

/// The latest cached copy of an object, stripped of high-churn fields.
/// Immutable once constructed; caches hand out clones or `Arc`s of this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
    pub resource_version: Option<String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<(String, String)>,
    /// The stripped object body, as a loosely-typed tree.
    pub data: serde_json::Value,
}

impl ResourceSnapshot {
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }

    /// True when the object's `creation_timestamp` is older than `threshold`
    /// relative to `now` — the sync-replay predicate used by §3/§4.7/P2.
    /// Per the Open Question's resolved decision (§9), this is the *only*
    /// predicate consulted; there is no `initial_sync_complete` fast path.
    pub fn is_sync_replay(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        match self.creation_timestamp {
            Some(created) => now.signed_duration_since(created) > threshold,
            None => false,
        }
    }
}
