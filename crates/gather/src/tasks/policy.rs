//! Disruption budgets of platform namespaces and admission webhooks.

use harvest_core::{DynamicObject, Record, ResourceMarshaller, TaskOutput};
use harvest_kubehub::{AccessError, PageBudget, Paged};

use crate::catalog::{shape_webhooks, Limit};
use crate::{access_failure, TaskContext};

const PDB_PAGE: u32 = 5000;
const PDB_LIMIT: usize = 100;

pub async fn pdbs(ctx: TaskContext) -> TaskOutput {
    let budget = PageBudget::new(PDB_PAGE, ctx.clients.budget().max_items);
    let listed = match ctx.clients.policy().pod_disruption_budgets(budget).await {
        Ok(p) => p,
        Err(e) => return access_failure("listing poddisruptionbudgets", e),
    };
    let platform: Vec<DynamicObject> =
        listed.items.iter().filter(|p| p.namespace().map_or(false, |ns| ns.starts_with("openshift"))).cloned().collect();
    let (kept, warning) = Limit::found(PDB_LIMIT).apply("poddisruptionbudgets", platform);
    let mut out = TaskOutput::new();
    for pdb in kept {
        let name = format!("config/pdbs/{}/{}", pdb.namespace().unwrap_or_default(), pdb.name());
        out.push(Record::new(name, ResourceMarshaller(pdb.into_value())));
    }
    for w in listed.warnings().into_iter().chain(warning) {
        out.warn(w);
    }
    out
}

fn webhook_records(listed: Result<Paged<DynamicObject>, AccessError>, prefix: &str) -> TaskOutput {
    let listed = match listed {
        Ok(p) => p,
        Err(e) => return access_failure(&format!("listing {prefix}"), e),
    };
    let mut out = TaskOutput::new();
    for mut hook in listed.items {
        shape_webhooks(&mut hook);
        out.push(Record::new(format!("config/{prefix}/{}", hook.name()), ResourceMarshaller(hook.into_value())));
    }
    for w in listed.skipped {
        out.warn(w);
    }
    out
}

pub async fn validating_webhooks(ctx: TaskContext) -> TaskOutput {
    webhook_records(ctx.clients.policy().validating_webhooks().await, "validatingwebhookconfigurations")
}

pub async fn mutating_webhooks(ctx: TaskContext) -> TaskOutput {
    webhook_records(ctx.clients.policy().mutating_webhooks().await, "mutatingwebhookconfigurations")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatherSettings;
    use harvest_kubehub::{gvr_of, Clients, MockCluster};
    use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
    use k8s_openapi::api::policy::v1::PodDisruptionBudget;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn ctx(m: MockCluster) -> TaskContext { TaskContext::new(Clients::new(Arc::new(m)), Arc::new(GatherSettings::default())) }

    #[tokio::test]
    async fn only_platform_pdbs_are_kept() {
        let pdb = |ns: &str, name: &str| json!({"metadata": {"name": name, "namespace": ns}});
        let m = MockCluster::new()
            .with(&gvr_of::<PodDisruptionBudget>(), vec![pdb("openshift-etcd", "etcd-quorum"), pdb("shop", "web"), pdb("openshift", "x")]);
        let out = pdbs(ctx(m)).await;
        let names: Vec<&str> = out.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["config/pdbs/openshift-etcd/etcd-quorum", "config/pdbs/openshift/x"]);
        assert!(out.outcomes.is_empty());
    }

    #[tokio::test]
    async fn pdbs_over_cap_are_cut_with_warning() {
        let items = (0..PDB_LIMIT + 3).map(|i| json!({"metadata": {"name": format!("p{i:03}"), "namespace": "openshift-a"}}));
        let m = MockCluster::new().with(&gvr_of::<PodDisruptionBudget>(), items);
        let out = pdbs(ctx(m)).await;
        assert_eq!(out.records.len(), PDB_LIMIT);
        assert_eq!(out.warnings().collect::<Vec<_>>(), vec!["found 103 resources, limit (100) reached"]);
    }

    #[tokio::test]
    async fn webhook_ca_bundles_are_masked() {
        let m = MockCluster::new().with(
            &gvr_of::<MutatingWebhookConfiguration>(),
            vec![json!({
                "metadata": {"name": "sriov"},
                "webhooks": [{"name": "a.sriov", "clientConfig": {"caBundle": "TUlJQw=="}, "sideEffects": "None", "admissionReviewVersions": ["v1"]}]
            })],
        );
        let out = mutating_webhooks(ctx(m)).await;
        assert_eq!(out.records[0].name, "config/mutatingwebhookconfigurations/sriov");
        let body: Value = serde_json::from_slice(&out.records[0].marshal().expect("hook")).expect("json");
        assert_eq!(body["webhooks"][0]["clientConfig"]["caBundle"], "xxxxxxxx");
    }
}
