//! The image registry config and, when it is backed by a claim, its volume.

use harvest_anonymize::FieldOp;
use harvest_core::{Gvr, Record, ResourceMarshaller, TaskOutput};
use harvest_kubehub::{AccessError, ListQuery, Profile};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use tracing::error;

use crate::shape::Shape;
use crate::{access_failure, TaskContext};

pub fn registry_configs() -> Gvr { Gvr::new("imageregistry.operator.openshift.io", "v1", "configs") }

fn registry_shape() -> Shape {
    let storage = |f: &str| FieldOp::anonymize(&format!("spec.storage.{f}"));
    Shape::ops(vec![
        FieldOp::anonymize("spec.httpSecret"),
        storage("s3.bucket"),
        storage("s3.keyID"),
        storage("s3.regionEndpoint"),
        storage("s3.region"),
        storage("azure.accountName"),
        storage("azure.container"),
        storage("gcs.bucket"),
        storage("gcs.projectID"),
        storage("gcs.keyID"),
        storage("swift.authURL"),
        storage("swift.container"),
        storage("swift.domain"),
        storage("swift.domainID"),
        storage("swift.tenant"),
        storage("swift.tenantID"),
        storage("swift.regionName"),
    ])
}

async fn volume_for_claim(ctx: &TaskContext, claim: &str) -> Result<Option<PersistentVolume>, AccessError> {
    let workload = ctx.clients.workload(Profile::Proto);
    let claims = workload.list::<PersistentVolumeClaim>(None, &ListQuery::default()).await?;
    let pvc = claims.items.into_iter().find(|c| c.metadata.name.as_deref() == Some(claim));
    let Some(volume) = pvc.and_then(|c| c.spec).and_then(|s| s.volume_name) else {
        return Err(AccessError::NotFound(format!("can't find any {claim} persistentvolumeclaim")));
    };
    workload.get::<PersistentVolume>(None, &volume).await
}

pub async fn gather(ctx: TaskContext) -> TaskOutput {
    let gvr = registry_configs();
    let config = match ctx.clients.dynamic().get(&gvr, None, "cluster").await {
        Ok(Some(c)) => c,
        Ok(None) => return TaskOutput::not_installed(),
        Err(e) => return access_failure("getting image registry config", e),
    };
    let claim = config.str_at(&["spec", "storage", "pvc", "claim"]).map(str::to_string);
    let mut out = TaskOutput::new();
    let name = format!("config/clusteroperator/{}/config/{}", gvr.group, config.name());
    out.push(Record::new(name, ResourceMarshaller(registry_shape().apply(config))));
    if let Some(claim) = claim {
        match volume_for_claim(&ctx, &claim).await {
            Ok(Some(pv)) => {
                let name = format!("config/persistentvolumes/{}", pv.metadata.name.as_deref().unwrap_or_default());
                out.push(Record::new(name, ResourceMarshaller(pv)));
            }
            Ok(None) => error!(claim = %claim, "image_registries: volume of claim not found"),
            Err(e) => error!(claim = %claim, error = %e, "image_registries: unable to find persistent volume"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatherSettings;
    use harvest_kubehub::{gvr_of, Clients, MockCluster};
    use serde_json::{json, Value};
    use std::sync::Arc;

    #[tokio::test]
    async fn config_is_scrubbed_and_volume_followed() {
        let m = MockCluster::new()
            .with(
                &registry_configs(),
                vec![json!({
                    "metadata": {"name": "cluster"},
                    "spec": {"httpSecret": "s3cr3t", "storage": {"pvc": {"claim": "image-registry-storage"}, "s3": {"bucket": "b1"}}}
                })],
            )
            .with(
                &gvr_of::<PersistentVolumeClaim>(),
                vec![json!({"metadata": {"name": "image-registry-storage", "namespace": "openshift-image-registry"}, "spec": {"volumeName": "pv-1"}})],
            )
            .with(&gvr_of::<PersistentVolume>(), vec![json!({"metadata": {"name": "pv-1"}})]);
        let ctx = TaskContext::new(Clients::new(Arc::new(m)), Arc::new(GatherSettings::default()));
        let out = gather(ctx).await;
        let names: Vec<&str> = out.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["config/clusteroperator/imageregistry.operator.openshift.io/config/cluster", "config/persistentvolumes/pv-1"]);
        let body: Value = serde_json::from_slice(&out.records[0].marshal().expect("config")).expect("json");
        assert_eq!(body["spec"]["httpSecret"], "xxxxxx");
        assert_eq!(body["spec"]["storage"]["s3"]["bucket"], "xx");
    }
}
