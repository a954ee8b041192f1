//! Cluster version, the cluster id, and the version operator's pods.

use harvest_anonymize::FieldOp;
use harvest_core::{names, RawBytes, Record, ResourceMarshaller, TaskOutput};
use harvest_kubehub::{ListQuery, Profile};
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::shape::Shape;
use crate::{access_failure, TaskContext};

const OPERATOR_NAMESPACE: &str = "openshift-cluster-version";

pub async fn gather(ctx: TaskContext) -> TaskOutput {
    let version = match ctx.clients.config().get("clusterversions", "version").await {
        Ok(Some(v)) => v,
        Ok(None) => return TaskOutput::not_installed(),
        Err(e) => return access_failure("getting clusterversion", e),
    };
    let id = version.str_at(&["spec", "clusterID"]).filter(|s| !s.is_empty()).map(str::to_string);
    let mut out = TaskOutput::new();
    out.push(Record::new("config/version", ResourceMarshaller(Shape::ops(vec![FieldOp::url("spec.upstream")]).apply(version))));
    if let Some(id) = id {
        out.push(Record::new("config/id", RawBytes::text(id)));
    }

    let pods = ctx.clients.workload(Profile::Proto).list_raw::<Pod>(Some(OPERATOR_NAMESPACE), &ListQuery::default()).await;
    match pods {
        Ok(pods) => {
            for p in pods.items {
                let name = names::pod(OPERATOR_NAMESPACE, p.name());
                out.push(Record::new(name, ResourceMarshaller(p.into_value())));
            }
        }
        Err(e) => debug!(error = %e, ns = OPERATOR_NAMESPACE, "version: operator pods unavailable"),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatherSettings;
    use harvest_kubehub::{gvr_of, Clients, ConfigClient, MockCluster};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn version_id_and_pods() {
        let m = MockCluster::new()
            .with(
                &ConfigClient::gvr("clusterversions"),
                vec![json!({
                    "metadata": {"name": "version"},
                    "spec": {"clusterID": "0b9ad8c4", "upstream": "https://api.example.com/graph"}
                })],
            )
            .with(&gvr_of::<Pod>(), vec![json!({"metadata": {"name": "cvo-1", "namespace": OPERATOR_NAMESPACE}})]);
        let ctx = TaskContext::new(Clients::new(Arc::new(m)), Arc::new(GatherSettings::default()));
        let out = gather(ctx).await;
        let names: Vec<&str> = out.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["config/version", "config/id", "config/pod/openshift-cluster-version/cvo-1"]);
        assert_eq!(out.records[1].marshal().expect("id"), b"0b9ad8c4");
        let v: serde_json::Value = serde_json::from_slice(&out.records[0].marshal().expect("version")).expect("json");
        assert_eq!(v["spec"]["upstream"], "xxxxx://xxx.xxxxxxx.xxx/xxxxx");
    }

    #[tokio::test]
    async fn absent_version_is_silent() {
        let ctx = TaskContext::new(Clients::new(Arc::new(MockCluster::new())), Arc::new(GatherSettings::default()));
        assert!(gather(ctx).await.is_empty());
    }
}
