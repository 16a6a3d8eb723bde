//! Historical event derivation (§4.7): condensed, human-meaningful labels
//! for a handful of kinds whose raw field diff is rarely what a reviewer
//! wants to read. Falls back to the diff engine's summary for everything
//! else, including every kind not named below.
//!
//! `extract` additionally derives the ancillary status-based events the
//! timeline store appends alongside (or, for a sync-replay add, instead of)
//! the `created` event: object creation, lifecycle milestones
//! (`Started`/`Completed`) and condition transitions, each carrying a
//! `Health` verdict (§4.7 "Historical events extraction").

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::k8s::diff::Diff;
use super::store::Health;

/// One derived ancillary event: a short label, the timestamp it actually
/// occurred at (not necessarily "now" — conditions carry their own
/// `lastTransitionTime`), and a health verdict.
pub struct HistoricalItem {
    pub label: String,
    pub timestamp: DateTime<Utc>,
    pub health: Health,
}

fn parse_ts(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Derives the ancillary historical events for one object, per kind
/// (§4.7). `created_at` falls back to "now" when the object carries no
/// creation timestamp, so a creation event is always produced.
pub fn extract(kind: &str, data: &Value, created_at: Option<DateTime<Utc>>) -> Vec<HistoricalItem> {
    let created_at = created_at.unwrap_or_else(Utc::now);
    let mut items = vec![HistoricalItem {
        label: "created".to_string(),
        timestamp: created_at,
        health: Health::Healthy,
    }];

    match kind {
        "Pod" => extract_pod(data, &mut items),
        "Deployment" => extract_deployment(data, &mut items),
        "Service" => {}
        "Job" => extract_job(data, &mut items),
        _ => {}
    }

    items
}

fn extract_pod(data: &Value, items: &mut Vec<HistoricalItem>) {
    if let Some(start_time) = data.get("status").and_then(|s| s.get("startTime")).and_then(parse_ts) {
        items.push(HistoricalItem {
            label: "started".to_string(),
            timestamp: start_time,
            health: Health::Healthy,
        });
    }

    if let Some(conditions) = data.get("status").and_then(|s| s.get("conditions")).and_then(Value::as_array) {
        for cond in conditions {
            let Some(transitioned_at) = cond.get("lastTransitionTime").and_then(parse_ts) else {
                continue;
            };
            let condition_type = cond.get("type").and_then(Value::as_str).unwrap_or("");
            let status = cond.get("status").and_then(Value::as_str).unwrap_or("Unknown");

            let health = if condition_type == "Ready" && status == "True" {
                Health::Healthy
            } else if status == "False" {
                Health::Degraded
            } else {
                Health::Unknown
            };

            items.push(HistoricalItem {
                label: format!("{condition_type}={status}"),
                timestamp: transitioned_at,
                health,
            });
        }
    }
}

fn extract_deployment(data: &Value, items: &mut Vec<HistoricalItem>) {
    if let Some(conditions) = data.get("status").and_then(|s| s.get("conditions")).and_then(Value::as_array) {
        for cond in conditions {
            let Some(transitioned_at) = cond.get("lastTransitionTime").and_then(parse_ts) else {
                continue;
            };
            let condition_type = cond.get("type").and_then(Value::as_str).unwrap_or("");
            let status = cond.get("status").and_then(Value::as_str).unwrap_or("Unknown");

            let health = if condition_type == "Available" && status == "True" {
                Health::Healthy
            } else if status == "False" {
                Health::Degraded
            } else {
                Health::Unknown
            };

            items.push(HistoricalItem {
                label: format!("{condition_type}={status}"),
                timestamp: transitioned_at,
                health,
            });
        }
    }
}

fn extract_job(data: &Value, items: &mut Vec<HistoricalItem>) {
    if let Some(start_time) = data.get("status").and_then(|s| s.get("startTime")).and_then(parse_ts) {
        items.push(HistoricalItem {
            label: "started".to_string(),
            timestamp: start_time,
            health: Health::Healthy,
        });
    }

    if let Some(completion_time) = data.get("status").and_then(|s| s.get("completionTime")).and_then(parse_ts) {
        let failed = data
            .get("status")
            .and_then(|s| s.get("failed"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        items.push(HistoricalItem {
            label: "completed".to_string(),
            timestamp: completion_time,
            health: if failed == 0 { Health::Healthy } else { Health::Unhealthy },
        });
    }
}

/// Produces a label that supersedes the generic diff summary when the
/// change matches one of the named rules, `None` otherwise so the caller
/// falls back to `Diff::summary`.
pub fn derive_label(kind: &str, old: Option<&Value>, new: &Value, diff: Option<&Diff>) -> Option<String> {
    match kind {
        "Pod" => pod_label(old, new),
        "Deployment" => deployment_label(old, new),
        "Service" => service_label(old, new),
        "Job" => job_label(old, new),
        _ => diff.map(|d| d.summary.clone()),
    }
}

fn phase(value: &Value) -> Option<&str> {
    value.get("status")?.get("phase")?.as_str()
}

fn restart_count(value: &Value) -> i64 {
    value
        .get("status")
        .and_then(|s| s.get("containerStatuses"))
        .and_then(Value::as_array)
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(|c| c.get("restartCount").and_then(Value::as_i64))
                .sum()
        })
        .unwrap_or(0)
}

fn waiting_reason(value: &Value) -> Option<String> {
    value
        .get("status")?
        .get("containerStatuses")?
        .as_array()?
        .iter()
        .find_map(|c| c.get("state")?.get("waiting")?.get("reason")?.as_str())
        .map(str::to_string)
}

fn pod_label(old: Option<&Value>, new: &Value) -> Option<String> {
    let new_phase = phase(new)?;
    let old_phase = old.and_then(phase);

    if old_phase != Some(new_phase) {
        return Some(format!("phase {}→{}", old_phase.unwrap_or("?"), new_phase));
    }

    if let Some(reason) = waiting_reason(new) {
        if reason == "CrashLoopBackOff" {
            return Some("CrashLoopBackOff".to_string());
        }
    }

    let old_restarts = old.map(restart_count).unwrap_or(0);
    let new_restarts = restart_count(new);
    if new_restarts > old_restarts {
        return Some(format!("restarted (count {new_restarts})"));
    }

    None
}

fn int_field(value: &Value, path: &[&str]) -> Option<i64> {
    let mut cur = value;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_i64()
}

fn deployment_label(old: Option<&Value>, new: &Value) -> Option<String> {
    let desired = int_field(new, &["spec", "replicas"]).unwrap_or(0);
    let available = int_field(new, &["status", "availableReplicas"]).unwrap_or(0);
    let old_available = old.and_then(|o| int_field(o, &["status", "availableReplicas"])).unwrap_or(-1);

    if available != old_available {
        if available >= desired && desired > 0 {
            return Some(format!("rollout complete ({available}/{desired} available)"));
        }
        return Some(format!("rollout progressing ({available}/{desired} available)"));
    }
    None
}

fn service_label(old: Option<&Value>, new: &Value) -> Option<String> {
    let new_type = new.get("spec")?.get("type")?.as_str()?;
    let old_type = old.and_then(|o| o.get("spec")).and_then(|s| s.get("type")).and_then(Value::as_str);
    if old_type != Some(new_type) {
        return Some(format!("type {}→{}", old_type.unwrap_or("?"), new_type));
    }

    let new_lb = new
        .get("status")
        .and_then(|s| s.get("loadBalancer"))
        .and_then(|lb| lb.get("ingress"))
        .and_then(Value::as_array)
        .filter(|arr| !arr.is_empty());
    let old_lb = old
        .and_then(|o| o.get("status"))
        .and_then(|s| s.get("loadBalancer"))
        .and_then(|lb| lb.get("ingress"))
        .and_then(Value::as_array)
        .filter(|arr| !arr.is_empty());
    if new_lb.is_some() && old_lb.is_none() {
        return Some("load balancer address assigned".to_string());
    }
    None
}

fn job_label(old: Option<&Value>, new: &Value) -> Option<String> {
    let new_succeeded = int_field(new, &["status", "succeeded"]).unwrap_or(0);
    let new_failed = int_field(new, &["status", "failed"]).unwrap_or(0);
    let old_succeeded = old.and_then(|o| int_field(o, &["status", "succeeded"])).unwrap_or(0);
    let old_failed = old.and_then(|o| int_field(o, &["status", "failed"])).unwrap_or(0);

    if new_succeeded > old_succeeded {
        return Some("completed".to_string());
    }
    if new_failed > old_failed {
        return Some("failed".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pod_phase_transition_is_labeled() {
        let old = json!({"status": {"phase": "Pending"}});
        let new = json!({"status": {"phase": "Running"}});
        assert_eq!(pod_label(Some(&old), &new), Some("phase Pending→Running".to_string()));
    }

    #[test]
    fn pod_restart_increment_is_labeled() {
        let old = json!({"status": {"phase": "Running", "containerStatuses": [{"restartCount": 1}]}});
        let new = json!({"status": {"phase": "Running", "containerStatuses": [{"restartCount": 2}]}});
        assert_eq!(pod_label(Some(&old), &new), Some("restarted (count 2)".to_string()));
    }

    #[test]
    fn deployment_rollout_complete_is_labeled() {
        let old = json!({"spec": {"replicas": 3}, "status": {"availableReplicas": 2}});
        let new = json!({"spec": {"replicas": 3}, "status": {"availableReplicas": 3}});
        assert_eq!(
            deployment_label(Some(&old), &new),
            Some("rollout complete (3/3 available)".to_string())
        );
    }

    #[test]
    fn job_completion_is_labeled() {
        let old = json!({"status": {"succeeded": 0}});
        let new = json!({"status": {"succeeded": 1}});
        assert_eq!(job_label(Some(&old), &new), Some("completed".to_string()));
    }

    #[test]
    fn unrelated_kind_falls_back_to_none() {
        assert_eq!(derive_label("ConfigMap", None, &json!({}), None), None);
    }
}
