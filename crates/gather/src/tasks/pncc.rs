//! Recent failures of pod network connectivity checks, by reason and message.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use harvest_core::{DynamicObject, Gvr, JsonMarshaller, Record, TaskOutput};
use harvest_kubehub::ListQuery;
use serde_json::Value;

use crate::{access_failure, TaskContext};

pub fn connectivity_checks() -> Gvr { Gvr::new("controlplane.operator.openshift.io", "v1alpha1", "podnetworkconnectivitychecks") }

pub type FailureIndex = BTreeMap<String, BTreeMap<String, DateTime<Utc>>>;

fn entry_time(e: &Value) -> Option<DateTime<Utc>> {
    e.get("time").and_then(Value::as_str).and_then(|t| DateTime::parse_from_rfc3339(t).ok()).map(|t| t.with_timezone(&Utc))
}

fn list(v: Option<&Value>) -> Vec<&Value> { v.and_then(Value::as_array).map(|a| a.iter().collect()).unwrap_or_default() }

/// Unsuccessful entries that started within the last day, latest time per
/// reason and message.
pub fn index_failures(checks: &[DynamicObject], now: DateTime<Utc>) -> FailureIndex {
    let cutoff = now - Duration::hours(24);
    let mut logs: Vec<&Value> = Vec::new();
    for c in checks {
        logs.extend(list(c.at(&["status", "failures"])));
        for outage in list(c.at(&["status", "outages"])) {
            logs.extend(list(outage.get("startLogs")));
            logs.extend(list(outage.get("endLogs")));
        }
    }
    let mut index = FailureIndex::new();
    for e in logs {
        let Some(at) = entry_time(e) else { continue };
        if at < cutoff || e.get("success").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        let text = |k: &str| e.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
        let slot = index.entry(text("reason")).or_default().entry(text("message")).or_insert(at);
        if at > *slot {
            *slot = at;
        }
    }
    index
}

pub async fn gather(ctx: TaskContext) -> TaskOutput {
    let checks = match ctx.clients.dynamic().list_all(&connectivity_checks(), None, &ListQuery::default()).await {
        Ok(p) => p,
        Err(e) => return access_failure("listing podnetworkconnectivitychecks", e),
    };
    let mut out = TaskOutput::new();
    out.push(Record::new("config/podnetworkconnectivitychecks", JsonMarshaller(index_failures(&checks.items, Utc::now()))));
    for w in checks.warnings() {
        out.warn(w);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_recent_failures_are_indexed() {
        let now = DateTime::parse_from_rfc3339("2024-03-02T12:00:00Z").expect("now").with_timezone(&Utc);
        let check = DynamicObject::new(json!({
            "metadata": {"name": "etcd-to-api", "namespace": "openshift-network-diagnostics"},
            "status": {
                "failures": [
                    {"time": "2024-03-02T10:00:00Z", "success": false, "reason": "TCPConnectError", "message": "refused"},
                    {"time": "2024-03-02T11:00:00Z", "success": false, "reason": "TCPConnectError", "message": "refused"},
                    {"time": "2024-02-20T11:00:00Z", "success": false, "reason": "Old", "message": "stale"}
                ],
                "outages": [{"startLogs": [{"time": "2024-03-02T09:00:00Z", "success": true, "reason": "TCPConnect", "message": "ok"}],
                             "endLogs": [{"time": "2024-03-02T09:30:00Z", "success": false, "reason": "DNSError", "message": "nxdomain"}]}]
            }
        }));
        let idx = index_failures(&[check], now);
        assert_eq!(idx.len(), 2);
        assert_eq!(idx["TCPConnectError"]["refused"].to_rfc3339(), "2024-03-02T11:00:00+00:00");
        assert!(idx.contains_key("DNSError"));
        assert!(!idx.contains_key("Old"));
    }
}
