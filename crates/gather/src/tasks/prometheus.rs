//! Scrapes: federated metrics, Alertmanager alerts, TSDB status and the
//! deployment validation operator's metrics endpoint.

use std::collections::BTreeMap;

use bytes::Bytes;
use harvest_core::{JsonMarshaller, RawBytes, RawJson, Record, TaskOutput};
use harvest_kubehub::{ListQuery, Profile, RawRequest, RestClient};
use k8s_openapi::api::core::v1::Service;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use crate::{access_failure, TaskContext};

pub const ALERT_LINES_LIMIT: usize = 1000;
pub const ALERT_LIMIT: usize = 1000;
const DVO_SELECTOR: &str = "name=deployment-validation-operator";
const DVO_PREFIX: &str = "deployment_validation_operator_";

/// Series federated into `config/metrics`.
pub const FEDERATED_SERIES: [&str; 9] = [
    "etcd_object_counts",
    "cluster_installer",
    "namespace:container_cpu_usage_seconds_total:sum_rate",
    "namespace:container_memory_usage_bytes:sum",
    "vsphere_node_hw_version_total",
    "virt_platform",
    "console_helm_installs_total",
    "console_helm_upgrades_total",
    "console_helm_uninstalls_total",
];

static IDENTIFYING_LABELS: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\b(?:name|namespace)="[^"]*",?"#).expect("static label pattern"));

/// Whole body of a raw GET, capped by the archive size; a cut body is a warning.
async fn fetch(ctx: &TaskContext, rest: &RestClient, req: &RawRequest, out: &mut TaskOutput) -> Result<Bytes, TaskOutput> {
    match rest.get_bytes(req, ctx.settings.archive_max_bytes).await {
        Ok((body, cut)) => {
            if cut {
                out.warn(format!("{}: response cut at {} bytes", req.path, ctx.settings.archive_max_bytes));
            }
            Ok(body)
        }
        Err(e) => {
            error!(path = %req.path, error = %e, "prometheus: request failed");
            Err(access_failure(&format!("GET {}", req.path), e))
        }
    }
}

/// First `limit` lines plus the number of lines seen in total.
pub fn first_lines(body: &[u8], limit: usize) -> (Vec<u8>, usize) {
    let mut kept = Vec::new();
    let mut total = 0usize;
    for line in body.split_inclusive(|b| *b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        if total < limit {
            kept.extend_from_slice(line);
        }
        total += 1;
    }
    if !kept.is_empty() && !kept.ends_with(b"\n") {
        kept.push(b'\n');
    }
    (kept, total)
}

pub async fn metrics(ctx: TaskContext) -> TaskOutput {
    let rest = ctx.clients.rest(Profile::Metrics);
    let mut out = TaskOutput::new();
    let federate = FEDERATED_SERIES.iter().fold(rest.request("/federate"), |r, m| r.param("match[]", m));
    let mut data = match fetch(&ctx, &rest, &federate, &mut out).await {
        Ok(b) => b.to_vec(),
        Err(failed) => return failed,
    };
    let alerts = rest.request("/federate").param("match[]", "ALERTS");
    let alert_body = match fetch(&ctx, &rest, &alerts, &mut out).await {
        Ok(b) => b,
        Err(failed) => return failed,
    };
    let (kept, total) = first_lines(&alert_body, ALERT_LINES_LIMIT);
    data.extend_from_slice(format!("# ALERTS {total}/{ALERT_LINES_LIMIT}\n").as_bytes());
    data.extend_from_slice(&kept);
    out.push(Record::new("config/metrics", RawBytes(Bytes::from(data))).always_stored());
    out
}

/// An Alertmanager v2 alert, reduced to what is archived.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Alert {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub ends_at: String,
    pub starts_at: String,
    pub updated_at: String,
    pub status: BTreeMap<String, Value>,
}

pub async fn active_alerts(ctx: TaskContext) -> TaskOutput {
    let rest = ctx.clients.rest(Profile::Alerts);
    let mut out = TaskOutput::new();
    let req = rest.request("/api/v2/alerts").param("active", "true");
    let body = match fetch(&ctx, &rest, &req, &mut out).await {
        Ok(b) => b,
        Err(failed) => return failed,
    };
    let mut alerts: Vec<Alert> = match serde_json::from_slice(&body) {
        Ok(a) => a,
        Err(e) => return TaskOutput::fatal(format!("unable to decode alerts: {e}")),
    };
    if alerts.len() > ALERT_LIMIT {
        out.fail(format!("alert limit {ALERT_LIMIT} was exceeded! There were {} alerts", alerts.len()));
        alerts.truncate(ALERT_LIMIT);
    }
    out.push(Record::new("config/alerts", JsonMarshaller(alerts)));
    out
}

pub async fn silenced_alerts(ctx: TaskContext) -> TaskOutput {
    let rest = ctx.clients.rest(Profile::Alerts);
    let mut out = TaskOutput::new();
    let req = rest.request("/api/v2/alerts").param("active", "false").param("silenced", "true").param("inhibited", "false");
    match fetch(&ctx, &rest, &req, &mut out).await {
        Ok(body) => out.push(Record::new("config/silenced_alerts", RawJson(body))),
        Err(failed) => return failed,
    }
    out
}

pub async fn tsdb_status(ctx: TaskContext) -> TaskOutput {
    let rest = ctx.clients.rest(Profile::Metrics);
    let mut out = TaskOutput::new();
    let req = rest.request("/api/v1/status/tsdb");
    let body = match fetch(&ctx, &rest, &req, &mut out).await {
        Ok(b) => b,
        Err(failed) => return failed,
    };
    if let Err(e) = serde_json::from_slice::<Value>(&body) {
        return TaskOutput::fatal(format!("unable to decode tsdb status: {e}"));
    }
    out.push(Record::new("config/tsdb_status", RawJson(body)));
    out
}

/// Lines carrying the operator's metric prefix, with workload identifying
/// labels dropped.
pub fn dvo_lines(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut out = String::new();
    for line in text.lines().filter(|l| l.starts_with(DVO_PREFIX)) {
        let stripped = IDENTIFYING_LABELS.replace_all(line, "");
        out.push_str(&stripped.replace(",}", "}"));
        out.push('\n');
    }
    out
}

pub async fn dvo_metrics(ctx: TaskContext) -> TaskOutput {
    let services = match ctx.clients.workload(Profile::Proto).list::<Service>(None, &ListQuery::labels(DVO_SELECTOR)).await {
        Ok(p) => p,
        Err(e) => return access_failure("listing dvo services", e),
    };
    let rest = ctx.clients.rest(Profile::Standard);
    let mut out = TaskOutput::new();
    let mut all = String::new();
    for svc in &services.items {
        let name = svc.metadata.name.as_deref().unwrap_or_default();
        let ns = svc.metadata.namespace.as_deref().unwrap_or_default();
        for port in svc.spec.iter().flat_map(|s| s.ports.iter().flatten()) {
            let path = format!("/api/v1/namespaces/{ns}/services/{name}:{}/proxy/metrics", port.port);
            let body = match rest.get_bytes(&rest.request(&path), ctx.settings.archive_max_bytes).await {
                Ok((b, _)) => b,
                Err(e) => {
                    warn!(endpoint = %path, error = %e, "dvo_metrics: unable to read metrics");
                    out.warn(format!("unable to read metrics from endpoint {path}: {e}"));
                    continue;
                }
            };
            all.push_str(&format!("# {path}\n"));
            all.push_str(&dvo_lines(&body));
        }
    }
    if all.is_empty() {
        warn!("dvo_metrics: no metrics gathered");
        if services.items.is_empty() {
            out.warn("no deployment-validation-operator service found");
        }
        return out;
    }
    out.push(Record::new("config/dvo_metrics", RawBytes::text(all)));
    out
}
