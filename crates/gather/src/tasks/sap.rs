//! SAP Data Intelligence clusters, recognised by their DataHub objects.

use std::collections::BTreeSet;

use harvest_core::{Gvr, Record, ResourceMarshaller, TaskOutput};
use harvest_kubehub::{AccessError, ListQuery, Profile, WorkloadClient};
use harvest_logs::{collect_logs_from_containers, ContainerFilter, MessageFilter};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;

use crate::{access_failure, TaskContext};

const SCCS: [&str; 2] = ["anyuid", "privileged"];
const IPTABLES_CONTAINER: &str = "^vsystem-iptables$";
const IPTABLES_FAILURE: &str = "can't initialize iptables table";

/// Marker kind: SAP tasks only run when one of these exists.
pub fn datahubs() -> Gvr { Gvr::new("installers.datahub.sap.com", "v1alpha1", "datahubs") }

pub fn security_context_constraints() -> Gvr { Gvr::new("security.openshift.io", "v1", "securitycontextconstraints") }

/// Distinct namespaces holding a DataHub, in listing order.
async fn datahub_namespaces(ctx: &TaskContext) -> Result<Vec<String>, AccessError> {
    let hubs = ctx.clients.dynamic().list_all(&datahubs(), None, &ListQuery::default()).await?;
    let mut seen = BTreeSet::new();
    Ok(hubs
        .items
        .iter()
        .filter_map(|h| h.namespace().map(str::to_string))
        .filter(|ns| seen.insert(ns.clone()))
        .collect())
}

pub async fn config(ctx: TaskContext) -> TaskOutput {
    let mut out = TaskOutput::new();
    let dynamic = ctx.clients.dynamic();
    for name in SCCS {
        match dynamic.get(&security_context_constraints(), None, name).await {
            Ok(Some(scc)) => out.push(Record::new(format!("config/securitycontextconstraint/{name}"), ResourceMarshaller(scc.into_value()))),
            Ok(None) => {}
            Err(e) => return access_failure(&format!("getting scc {name}"), e),
        }
    }
    let workload = ctx.clients.workload(Profile::Standard);
    for scc in SCCS {
        let name = format!("system:openshift:scc:{scc}");
        match workload.get::<ClusterRoleBinding>(None, &name).await {
            Ok(Some(crb)) => out.push(Record::new(format!("config/clusterrolebinding/{}", name.replace(':', "_")), ResourceMarshaller(crb))),
            Ok(None) => {}
            Err(e) => return access_failure(&format!("getting clusterrolebinding {name}"), e),
        }
    }
    out
}

async fn owned_by_succeeded_job(workload: &WorkloadClient, pod: &Pod) -> Result<bool, AccessError> {
    let ns = pod.metadata.namespace.as_deref();
    for owner in pod.metadata.owner_references.iter().flatten().filter(|o| o.kind == "Job") {
        let job = workload.get::<Job>(ns, &owner.name).await?;
        if job.and_then(|j| j.status).and_then(|s| s.succeeded).unwrap_or(0) > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

pub async fn pods(ctx: TaskContext) -> TaskOutput {
    let namespaces = match datahub_namespaces(&ctx).await {
        Ok(n) => n,
        Err(e) => return access_failure("listing datahubs", e),
    };
    let workload = ctx.clients.workload(Profile::Proto);
    let mut out = TaskOutput::new();
    for ns in &namespaces {
        let listed = match workload.list::<Pod>(Some(ns), &ListQuery::default()).await {
            Ok(p) => p,
            Err(AccessError::NotFound(_)) => continue,
            Err(e) => return access_failure(&format!("listing pods in {ns}"), e),
        };
        for pod in listed.items {
            let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
            if matches!(phase, Some("Running") | Some("Succeeded")) {
                continue;
            }
            match owned_by_succeeded_job(&workload, &pod).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => return access_failure("getting owner job", e),
            }
            let name = harvest_core::names::pod(ns, pod.metadata.name.as_deref().unwrap_or_default());
            out.push(Record::new(name, ResourceMarshaller(pod)));
        }
    }
    out
}

pub async fn datahub_objects(ctx: TaskContext) -> TaskOutput {
    let gvr = datahubs();
    let listed = match ctx.clients.dynamic().list_all(&gvr, None, &ListQuery::default()).await {
        Ok(p) => p,
        Err(e) => return access_failure("listing datahubs", e),
    };
    let mut out = TaskOutput::new();
    for hub in listed.items {
        let name = format!("customresources/{}/{}/{}/{}", gvr.group, gvr.resource, hub.namespace().unwrap_or_default(), hub.name());
        out.push(Record::new(name, ResourceMarshaller(hub.into_value())));
    }
    for w in listed.skipped {
        out.warn(w);
    }
    out
}

pub async fn license_management_logs(ctx: TaskContext) -> TaskOutput {
    let namespaces = match datahub_namespaces(&ctx).await {
        Ok(n) => n,
        Err(e) => return access_failure("listing datahubs", e),
    };
    let messages = MessageFilter::substrings(&[IPTABLES_FAILURE]);
    let mut out = TaskOutput::new();
    for ns in &namespaces {
        let filter = ContainerFilter::namespace(ns).containers(IPTABLES_CONTAINER);
        out.extend(collect_logs_from_containers(&ctx.clients, &filter, &messages, None).await);
    }
    out
}
