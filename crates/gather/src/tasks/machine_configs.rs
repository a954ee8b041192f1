//! Machine configs referenced by a pool or a node; the rest are only counted.

use std::collections::BTreeSet;

use harvest_anonymize::FieldOp;
use harvest_core::{names, Gvr, JsonMarshaller, Record, ResourceMarshaller, TaskOutput};
use harvest_kubehub::{AccessError, ListQuery, Profile};
use k8s_openapi::api::core::v1::Node;
use serde_json::json;
use tracing::debug;

use crate::shape::Shape;
use crate::{access_failure, TaskContext};

const CURRENT_CONFIG: &str = "machineconfiguration.openshift.io/currentConfig";
const DESIRED_CONFIG: &str = "machineconfiguration.openshift.io/desiredConfig";

pub fn machine_configs() -> Gvr { Gvr::new("machineconfiguration.openshift.io", "v1", "machineconfigs") }
pub fn machine_config_pools() -> Gvr { Gvr::new("machineconfiguration.openshift.io", "v1", "machineconfigpools") }

/// Names referenced by pool configurations and node annotations.
pub async fn in_use(ctx: &TaskContext) -> Result<BTreeSet<String>, AccessError> {
    let mut used = BTreeSet::new();
    let pools = ctx.clients.dynamic().list_all(&machine_config_pools(), None, &ListQuery::default()).await?;
    for p in &pools.items {
        for path in [["status", "configuration", "name"], ["spec", "configuration", "name"]] {
            if let Some(n) = p.str_at(&path).filter(|s| !s.is_empty()) {
                used.insert(n.to_string());
            }
        }
    }
    let nodes = ctx.clients.workload(Profile::Proto).list::<Node>(None, &ListQuery::default()).await?;
    for node in &nodes.items {
        let Some(ann) = node.metadata.annotations.as_ref() else { continue };
        used.extend([CURRENT_CONFIG, DESIRED_CONFIG].iter().filter_map(|k| ann.get(*k)).cloned());
    }
    Ok(used)
}

pub async fn gather(ctx: TaskContext) -> TaskOutput {
    let mut out = TaskOutput::new();
    let used = match in_use(&ctx).await {
        Ok(u) => u,
        Err(e) => {
            out.warn(format!("getting in-use machine configs failed: {e}"));
            BTreeSet::new()
        }
    };
    let listed = ctx.clients.dynamic().list_all(&machine_configs(), None, &ListQuery::default()).await;
    let paged = match listed {
        Ok(p) => p,
        Err(e) => {
            let failure = access_failure("listing machineconfigs", e);
            if failure.is_empty() {
                return failure;
            }
            out.extend(failure);
            return out;
        }
    };
    let shape = Shape::ops(vec![FieldOp::remove("spec.config.storage.files"), FieldOp::remove("spec.config.passwd.users")]);
    let mut unused = 0usize;
    for mc in paged.items.iter().cloned() {
        if !used.is_empty() && !used.contains(mc.name()) {
            unused += 1;
            continue;
        }
        let name = format!("config/machineconfigs/{}", mc.name());
        out.push(Record::new(name, ResourceMarshaller(shape.apply(mc))));
    }
    debug!(unused, in_use = used.len(), "machine_configs: filtered");
    out.push(Record::new(names::aggregated("unused_machine_configs_count"), JsonMarshaller(json!({"unused_machineconfigs_count": unused}))));
    for w in paged.warnings() {
        out.warn(w);
    }
    out
}
