//! Ingress transforms applied to every watched object before it is cached:
//! stripping server-side managed fields and the last-applied-configuration
//! annotation (§3 "Resource snapshot"), and the narrower projection applied
//! to native `Event` objects (§3, §4.3).

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use super::snapshot::ResourceSnapshot;

pub const LAST_APPLIED_ANNOTATION: &str =
    "kubectl.kubernetes.io/last-applied-configuration";

/// Strips `metadata.managedFields` and the last-applied-configuration
/// annotation in place. Lossless for every semantic the engine promises;
/// downstream consumers must not depend on either field (§3).
pub fn strip_heavy_fields(value: &mut Value) {
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("managedFields");
        if let Some(annotations) = metadata.get_mut("annotations").and_then(Value::as_object_mut) {
            annotations.remove(LAST_APPLIED_ANNOTATION);
            if annotations.is_empty() {
                metadata.remove("annotations");
            }
        }
    }
}

/// Narrower projection applied to native `Event` objects: identity, involved
/// object, reason, message, type, count, first/last timestamps only (§3, §4.3).
pub fn project_event(value: &Value) -> Value {
    let get = |path: &str| value.get(path).cloned().unwrap_or(Value::Null);
    serde_json::json!({
        "metadata": {
            "name": get("metadata").get("name"),
            "namespace": get("metadata").get("namespace"),
            "uid": get("metadata").get("uid"),
            "creationTimestamp": get("metadata").get("creationTimestamp"),
        },
        "involvedObject": get("involvedObject"),
        "reason": get("reason"),
        "message": get("message"),
        "type": get("type"),
        "count": get("count"),
        "firstTimestamp": get("firstTimestamp"),
        "lastTimestamp": get("lastTimestamp"),
    })
}

fn string_field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str()
}

fn parse_timestamp(value: &Value, path: &[&str]) -> Option<DateTime<Utc>> {
    string_field(value, path).and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|dt| dt.with_timezone(&Utc))
}

/// Builds a `ResourceSnapshot` from a raw (already stripped) object body.
/// Used uniformly by the typed cache (after serializing a concrete
/// k8s-openapi struct to JSON) and the dynamic cache (`DynamicObject`'s data).
pub fn to_snapshot(kind: &str, mut data: Value) -> Option<ResourceSnapshot> {
    strip_heavy_fields(&mut data);

    let name = string_field(&data, &["metadata", "name"])?.to_string();
    let namespace = string_field(&data, &["metadata", "namespace"]).map(|s| s.to_string());
    let uid = string_field(&data, &["metadata", "uid"])
        .unwrap_or_default()
        .to_string();
    let resource_version = string_field(&data, &["metadata", "resourceVersion"]).map(|s| s.to_string());
    let creation_timestamp = parse_timestamp(&data, &["metadata", "creationTimestamp"]);

    let labels = data
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    let owner = data
        .get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(Value::as_array)
        .and_then(|refs| {
            refs.iter().find(|r| {
                r.get("controller")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            })
        })
        .and_then(|owner_ref| {
            let owner_kind = owner_ref.get("kind")?.as_str()?.to_string();
            let owner_name = owner_ref.get("name")?.as_str()?.to_string();
            Some((owner_kind, owner_name))
        });

    Some(ResourceSnapshot {
        kind: kind.to_string(),
        namespace,
        name,
        uid,
        resource_version,
        creation_timestamp,
        labels,
        owner,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_managed_fields_and_last_applied() {
        let mut value = json!({
            "metadata": {
                "name": "x",
                "managedFields": [{"manager": "kubectl"}],
                "annotations": {
                    LAST_APPLIED_ANNOTATION: "{...}",
                    "kept": "yes",
                }
            }
        });
        strip_heavy_fields(&mut value);
        assert!(value["metadata"].get("managedFields").is_none());
        assert_eq!(value["metadata"]["annotations"]["kept"], "yes");
        assert!(value["metadata"]["annotations"].get(LAST_APPLIED_ANNOTATION).is_none());
    }

    #[test]
    fn strips_annotations_entirely_when_emptied() {
        let mut value = json!({
            "metadata": {
                "name": "x",
                "annotations": { LAST_APPLIED_ANNOTATION: "{...}" }
            }
        });
        strip_heavy_fields(&mut value);
        assert!(value["metadata"].get("annotations").is_none());
    }

    #[test]
    fn event_projection_keeps_only_the_narrow_field_set() {
        let value = json!({
            "metadata": {"name": "ev1", "namespace": "default", "uid": "u1", "creationTimestamp": "2024-01-01T00:00:00Z"},
            "involvedObject": {"kind": "Pod", "name": "x"},
            "reason": "Scheduled",
            "message": "msg",
            "type": "Normal",
            "count": 3,
            "firstTimestamp": "2024-01-01T00:00:00Z",
            "lastTimestamp": "2024-01-01T00:00:05Z",
            "source": {"component": "kubelet"},
        });
        let projected = project_event(&value);
        assert_eq!(projected["reason"], "Scheduled");
        assert!(projected.get("source").is_none());
    }

    #[test]
    fn to_snapshot_extracts_identity_and_owner() {
        let value = json!({
            "metadata": {
                "name": "web-abc",
                "namespace": "d1",
                "uid": "uid-1",
                "resourceVersion": "123",
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "labels": {"app": "web"},
                "ownerReferences": [{"kind": "ReplicaSet", "name": "web-abc", "controller": true}],
            }
        });
        let snapshot = to_snapshot("Pod", value).unwrap();
        assert_eq!(snapshot.name, "web-abc");
        assert_eq!(snapshot.namespace.as_deref(), Some("d1"));
        assert_eq!(snapshot.owner, Some(("ReplicaSet".to_string(), "web-abc".to_string())));
        assert_eq!(snapshot.labels.get("app"), Some(&"web".to_string()));
    }

    #[test]
    fn to_snapshot_rejects_object_without_name() {
        let value = json!({"metadata": {}});
        assert!(to_snapshot("Pod", value).is_none());
    }
}
