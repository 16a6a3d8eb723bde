//! Diff Engine (C6, §4.6): semantic diffs between old and new snapshots of
//! the same kind. Computed outside any lock on the timeline store — callers
//! own the two `Value`s by clone before calling in.

use serde_json::Value;

/// One differing leaf field.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldDiff {
    pub path: String,
    pub old_value: Value,
    pub new_value: Value,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Diff {
    pub summary: String,
    pub fields: Vec<FieldDiff>,
}

/// Fields excluded from the walk: high-churn bookkeeping that does not
/// reflect a meaningful change to a human reviewer (§4.6).
const EXCLUDED_PATHS: &[&str] = &[
    "metadata.resourceVersion",
    "metadata.managedFields",
    "metadata.generation",
    "status.observedGeneration",
];

fn is_excluded(path: &str) -> bool {
    EXCLUDED_PATHS.iter().any(|p| path == *p || path.starts_with(&format!("{p}.")))
}

/// Computes the field-level diff between two object bodies of the same kind.
pub fn diff_snapshots(old: &Value, new: &Value) -> Diff {
    let mut fields = Vec::new();
    walk("", old, new, &mut fields);
    let summary = summarize(&fields, old, new);
    Diff { summary, fields }
}

fn walk(prefix: &str, old: &Value, new: &Value, out: &mut Vec<FieldDiff>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut keys: Vec<&String> = old_map.keys().chain(new_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if is_excluded(&path) {
                    continue;
                }
                let old_val = old_map.get(key).unwrap_or(&Value::Null);
                let new_val = new_map.get(key).unwrap_or(&Value::Null);
                walk(&path, old_val, new_val, out);
            }
        }
        (Value::Array(old_arr), Value::Array(new_arr)) => {
            let len = old_arr.len().max(new_arr.len());
            for i in 0..len {
                let path = format!("{prefix}[{i}]");
                if is_excluded(&path) {
                    continue;
                }
                let old_val = old_arr.get(i).unwrap_or(&Value::Null);
                let new_val = new_arr.get(i).unwrap_or(&Value::Null);
                walk(&path, old_val, new_val, out);
            }
        }
        _ => {
            if old != new {
                out.push(FieldDiff {
                    path: prefix.to_string(),
                    old_value: old.clone(),
                    new_value: new.clone(),
                });
            }
        }
    }
}

/// Picks a short natural-language summary from the dominant change, falling
/// back to a generic field count. Checks a fixed priority list of paths that
/// matter most for human review (§4.6): image, replicas, ready counts,
/// conditions, then labels/annotations.
fn summarize(fields: &[FieldDiff], old: &Value, new: &Value) -> String {
    if fields.is_empty() {
        return "no semantic change".to_string();
    }

    if let Some(diff) = image_diff(fields) {
        return diff;
    }
    if let (Some(old_r), Some(new_r)) = (
        find_i64(old, &["spec", "replicas"]),
        find_i64(new, &["spec", "replicas"]),
    ) {
        if old_r != new_r {
            return format!("replicas {old_r}→{new_r}");
        }
    }
    if let (Some(old_r), Some(new_r)) = (
        find_i64(old, &["status", "readyReplicas"]),
        find_i64(new, &["status", "readyReplicas"]),
    ) {
        if old_r != new_r {
            return format!("ready {old_r}→{new_r}");
        }
    }
    if fields.iter().any(|f| f.path.starts_with("status.conditions")) {
        return "condition changed".to_string();
    }
    if fields
        .iter()
        .any(|f| f.path.starts_with("metadata.labels") || f.path.starts_with("metadata.annotations"))
    {
        return "labels/annotations changed".to_string();
    }

    format!("{} field(s) changed", fields.len())
}

fn image_diff(fields: &[FieldDiff]) -> Option<String> {
    fields
        .iter()
        .find(|f| f.path.ends_with(".image"))
        .map(|f| {
            format!(
                "image: {}→{}",
                f.old_value.as_str().unwrap_or("?"),
                f.new_value.as_str().unwrap_or("?")
            )
        })
}

fn find_i64(value: &Value, path: &[&str]) -> Option<i64> {
    let mut cur = value;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_replica_scale() {
        let old = json!({"spec": {"replicas": 3}});
        let new = json!({"spec": {"replicas": 5}});
        let diff = diff_snapshots(&old, &new);
        assert_eq!(diff.summary, "replicas 3→5");
        assert_eq!(diff.fields.len(), 1);
        assert_eq!(diff.fields[0].path, "spec.replicas");
    }

    #[test]
    fn excludes_resource_version_and_managed_fields() {
        let old = json!({"metadata": {"resourceVersion": "1", "managedFields": [1]}});
        let new = json!({"metadata": {"resourceVersion": "2", "managedFields": [2]}});
        let diff = diff_snapshots(&old, &new);
        assert!(diff.fields.is_empty());
        assert_eq!(diff.summary, "no semantic change");
    }

    #[test]
    fn detects_image_change_at_any_depth() {
        let old = json!({"spec": {"template": {"spec": {"containers": [{"image": "a:1"}]}}}});
        let new = json!({"spec": {"template": {"spec": {"containers": [{"image": "a:2"}]}}}});
        let diff = diff_snapshots(&old, &new);
        assert_eq!(diff.summary, "image: a:1→a:2");
    }

    #[test]
    fn detects_image_change_among_multiple_containers() {
        let old = json!({"spec": {"template": {"spec": {"containers": [
            {"name": "sidecar", "image": "s:1"},
            {"name": "app", "image": "a:1"}
        ]}}}});
        let new = json!({"spec": {"template": {"spec": {"containers": [
            {"name": "sidecar", "image": "s:1"},
            {"name": "app", "image": "a:2"}
        ]}}}});
        let diff = diff_snapshots(&old, &new);
        assert_eq!(diff.summary, "image: a:1→a:2");
        assert_eq!(diff.fields.len(), 1);
        assert_eq!(diff.fields[0].path, "spec.template.spec.containers[1].image");
    }

    #[test]
    fn falls_back_to_field_count_for_unrecognized_changes() {
        let old = json!({"spec": {"weird": "x"}});
        let new = json!({"spec": {"weird": "y"}});
        let diff = diff_snapshots(&old, &new);
        assert_eq!(diff.summary, "1 field(s) changed");
    }
}
