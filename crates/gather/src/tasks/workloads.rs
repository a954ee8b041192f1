//! Counters over pods and service accounts.

use std::collections::{BTreeMap, HashMap};

use harvest_core::{names, JsonMarshaller, Record, ResourceMarshaller, TaskOutput};
use harvest_kubehub::{ListQuery, PageBudget, Profile};
use k8s_openapi::api::core::v1::{ContainerStatus, Namespace, Pod, ServiceAccount};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::{access_failure, TaskContext};

const POD_PAGE: u32 = 200;
const IMAGE_LIMIT: usize = 1000;
const SERVICE_ACCOUNT_LIMIT: usize = 1000;
const DEFAULT_NAMESPACES: [&str; 3] = ["default", "kube-system", "kube-public"];

/// Images indexed from 0, most common first, and per creation month how many
/// containers ran each image index.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct ContainerInfo {
    pub images: BTreeMap<usize, String>,
    pub containers: BTreeMap<String, BTreeMap<usize, usize>>,
}

/// A container that restarted after a failure or is backing off.
pub fn in_crashloop(status: &ContainerStatus) -> bool {
    if status.restart_count == 0 {
        return false;
    }
    let Some(last) = status.last_state.as_ref() else { return false };
    let failed = last.terminated.as_ref().map_or(false, |t| t.exit_code != 0);
    let backing_off = last.waiting.as_ref().and_then(|w| w.reason.as_deref()) == Some("CrashLoopBackOff");
    failed || backing_off
}

fn pod_in_crashloop(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else { return false };
    status.container_statuses.iter().flatten().chain(status.init_container_statuses.iter().flatten()).any(in_crashloop)
}

/// Digest of a pinned image reference, otherwise the reference itself.
fn image_id(image: &str) -> &str {
    match image.split_once('@') {
        Some((_, digest)) if !digest.is_empty() => digest,
        _ => image,
    }
}

fn summarize(counts: HashMap<String, BTreeMap<String, usize>>) -> ContainerInfo {
    let mut ranked: Vec<(String, BTreeMap<String, usize>, usize)> = counts
        .into_iter()
        .map(|(img, months)| {
            let total = months.values().sum();
            (img, months, total)
        })
        .collect();
    ranked.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
    let mut info = ContainerInfo::default();
    let mut entries = 0usize;
    for (img, months, _) in ranked {
        if entries >= IMAGE_LIMIT {
            break;
        }
        let idx = info.images.len();
        info.images.insert(idx, img);
        for (month, n) in months {
            *info.containers.entry(month).or_default().entry(idx).or_default() += n;
            entries += 1;
        }
    }
    info
}

pub async fn container_images(ctx: TaskContext) -> TaskOutput {
    let workload = ctx.clients.workload(Profile::Proto);
    let budget = PageBudget::new(POD_PAGE, usize::MAX);
    let pods = match workload.list_with::<Pod>(None, &ListQuery::default(), budget).await {
        Ok(p) => p,
        Err(e) => return access_failure("listing pods", e),
    };
    let mut out = TaskOutput::new();
    let mut counts: HashMap<String, BTreeMap<String, usize>> = HashMap::new();
    for pod in &pods.items {
        let ns = pod.metadata.namespace.as_deref().unwrap_or_default();
        if ns.starts_with("openshift-") && pod_in_crashloop(pod) {
            let name = names::pod(ns, pod.metadata.name.as_deref().unwrap_or_default());
            out.push(Record::new(name, ResourceMarshaller(pod.clone())));
            continue;
        }
        let Some(status) = pod.status.as_ref().filter(|s| s.phase.as_deref() == Some("Running")) else { continue };
        let month = pod.metadata.creation_timestamp.as_ref().map(|t| t.0.format("%Y-%m").to_string()).unwrap_or_default();
        let statuses = status
            .container_statuses
            .iter()
            .flatten()
            .chain(status.init_container_statuses.iter().flatten())
            .chain(status.ephemeral_container_statuses.iter().flatten());
        for c in statuses {
            *counts.entry(image_id(&c.image).to_string()).or_default().entry(month.clone()).or_default() += 1;
        }
    }
    debug!(pods = pods.items.len(), images = counts.len(), "container_images: counted");
    out.push(Record::new("config/running_containers", JsonMarshaller(summarize(counts))));
    for w in pods.warnings() {
        out.warn(w);
    }
    out
}

pub async fn service_accounts(ctx: TaskContext) -> TaskOutput {
    let workload = ctx.clients.workload(Profile::Proto);
    let namespaces = match workload.list::<Namespace>(None, &ListQuery::default()).await {
        Ok(p) => p,
        Err(e) => return access_failure("listing namespaces", e),
    };
    let mut targets: Vec<String> = DEFAULT_NAMESPACES.iter().map(|s| s.to_string()).collect();
    targets.extend(namespaces.items.iter().filter_map(|n| n.metadata.name.clone()).filter(|n| n.starts_with("openshift-")));
    let mut total = 0usize;
    let mut per_namespace: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
    let mut kept = 0usize;
    let q = ListQuery::default().with_limit(SERVICE_ACCOUNT_LIMIT as u32);
    for ns in &targets {
        let page = match workload.page::<ServiceAccount>(Some(ns), &q).await {
            Ok((items, _)) => items,
            Err(e) => {
                debug!(namespace = %ns, error = %e, "service_accounts: unable to list");
                continue;
            }
        };
        total += page.len();
        for sa in page {
            if kept >= SERVICE_ACCOUNT_LIMIT {
                break;
            }
            kept += 1;
            let secrets = sa.secrets.as_ref().map_or(0, Vec::len);
            per_namespace
                .entry(ns.clone())
                .or_default()
                .push(json!({"name": sa.metadata.name.unwrap_or_default(), "secrets": secrets}));
        }
    }
    let body = json!({"serviceAccounts": {"TOTAL_COUNT": total, "namespaces": per_namespace}});
    TaskOutput::from_records(vec![Record::new("config/serviceaccounts", JsonMarshaller(body))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatherSettings;
    use harvest_kubehub::{gvr_of, Clients, MockCluster};
    use serde_json::Value;
    use std::sync::Arc;

    fn ctx(m: MockCluster) -> TaskContext { TaskContext::new(Clients::new(Arc::new(m)), Arc::new(GatherSettings::default())) }

    fn running(ns: &str, name: &str, created: &str, images: &[&str]) -> Value {
        let statuses: Vec<Value> = images
            .iter()
            .enumerate()
            .map(|(i, img)| json!({"name": format!("c{i}"), "image": img, "imageID": "", "ready": true, "restartCount": 0}))
            .collect();
        json!({
            "metadata": {"name": name, "namespace": ns, "creationTimestamp": created},
            "status": {"phase": "Running", "containerStatuses": statuses}
        })
    }

    #[tokio::test]
    async fn images_are_counted_per_month() {
        let crashing = json!({
            "metadata": {"name": "bad", "namespace": "openshift-etcd"},
            "status": {"phase": "Running", "containerStatuses": [{
                "name": "etcd", "image": "quay.io/etcd", "imageID": "", "ready": false, "restartCount": 4,
                "lastState": {"terminated": {"exitCode": 1}}
            }]}
        });
        let m = MockCluster::new().with(
            &gvr_of::<Pod>(),
            vec![
                running("a", "p1", "2024-01-05T00:00:00Z", &["quay.io/app@sha256:abc", "nginx:1"]),
                running("a", "p2", "2024-02-05T00:00:00Z", &["quay.io/app@sha256:abc"]),
                crashing,
            ],
        );
        let out = container_images(ctx(m)).await;
        let names: Vec<&str> = out.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["config/pod/openshift-etcd/bad", "config/running_containers"]);
        let body: Value = serde_json::from_slice(&out.records[1].marshal().expect("info")).expect("json");
        assert_eq!(body["images"]["0"], "sha256:abc");
        assert_eq!(body["images"]["1"], "nginx:1");
        assert_eq!(body["containers"]["2024-01"]["0"], 1);
        assert_eq!(body["containers"]["2024-02"]["0"], 1);
        assert_eq!(body["containers"]["2024-01"]["1"], 1);
    }

    #[tokio::test]
    async fn service_accounts_cover_default_and_openshift_namespaces() {
        let sa = |ns: &str, name: &str, secrets: usize| {
            let s: Vec<Value> = (0..secrets).map(|i| json!({"name": format!("s{i}")})).collect();
            json!({"metadata": {"name": name, "namespace": ns}, "secrets": s})
        };
        let m = MockCluster::new()
            .with(
                &gvr_of::<Namespace>(),
                vec![json!({"metadata": {"name": "openshift-etcd"}}), json!({"metadata": {"name": "customer"}})],
            )
            .with(
                &gvr_of::<ServiceAccount>(),
                vec![sa("default", "default", 1), sa("openshift-etcd", "etcd", 2), sa("customer", "app", 0)],
            );
        let out = service_accounts(ctx(m)).await;
        let body: Value = serde_json::from_slice(&out.records[0].marshal().expect("sa")).expect("json");
        assert_eq!(body["serviceAccounts"]["TOTAL_COUNT"], 2);
        assert_eq!(body["serviceAccounts"]["namespaces"]["openshift-etcd"][0]["secrets"], 2);
        assert!(body["serviceAccounts"]["namespaces"].get("customer").is_none());
    }

    #[test]
    fn crashloop_needs_restarts() {
        let status: ContainerStatus = serde_json::from_value(json!({
            "name": "c", "image": "i", "imageID": "", "ready": false, "restartCount": 0,
            "lastState": {"terminated": {"exitCode": 1}}
        }))
        .expect("status");
        assert!(!in_crashloop(&status));
        let waiting: ContainerStatus = serde_json::from_value(json!({
            "name": "c", "image": "i", "imageID": "", "ready": false, "restartCount": 2,
            "lastState": {"waiting": {"reason": "CrashLoopBackOff"}}
        }))
        .expect("status");
        assert!(in_crashloop(&waiting));
    }
}
