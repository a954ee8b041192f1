//! Operator Lifecycle Manager: install plan statistics and installed operators.

use std::collections::BTreeMap;

use harvest_core::{DynamicObject, Gvr, JsonMarshaller, Record, TaskOutput};
use harvest_kubehub::{ListQuery, PageBudget, Profile};
use k8s_openapi::api::core::v1::Namespace;
use serde::Serialize;
use serde_json::{json, Value};

use crate::{access_failure, TaskContext};

const PLAN_PAGE: u32 = 500;
const PLAN_ITEMS: usize = 100;

pub fn install_plans_gvr() -> Gvr { Gvr::new("operators.coreos.com", "v1alpha1", "installplans") }
pub fn operators_gvr() -> Gvr { Gvr::new("operators.coreos.com", "v1", "operators") }
pub fn csv_gvr() -> Gvr { Gvr::new("operators.coreos.com", "v1alpha1", "clusterserviceversions") }

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanGroup {
    pub ns: String,
    pub name: String,
    pub csv: String,
    pub count: usize,
}

/// Collapses plans sharing namespace, generateName and first CSV.
#[derive(Debug, Default)]
pub struct PlanStats {
    groups: BTreeMap<String, PlanGroup>,
    total: usize,
}

impl PlanStats {
    pub fn add(&mut self, plan: &DynamicObject) {
        self.total += 1;
        let ns = plan.namespace().unwrap_or_default();
        let gen = plan.str_at(&["metadata", "generateName"]).unwrap_or_default();
        let csv = plan
            .at(&["spec", "clusterServiceVersionNames"])
            .and_then(Value::as_array)
            .and_then(|l| l.first())
            .and_then(Value::as_str)
            .unwrap_or("[NONE]");
        let key = format!("{ns}.{gen}.{csv}");
        self.groups
            .entry(key)
            .or_insert_with(|| PlanGroup { ns: ns.to_string(), name: gen.to_string(), csv: csv.to_string(), count: 0 })
            .count += 1;
    }

    /// The most frequent groups, at most `limit`, highest count first.
    pub fn report(&self, limit: usize) -> Value {
        let mut items: Vec<&PlanGroup> = self.groups.values().collect();
        items.sort_by(|a, b| b.count.cmp(&a.count));
        items.truncate(limit);
        json!({
            "stats": {"TOTAL_COUNT": self.total, "TOTAL_NONUNIQ_COUNT": self.groups.len()},
            "items": items,
        })
    }
}

pub async fn install_plans(ctx: TaskContext) -> TaskOutput {
    let namespaces = match ctx.clients.workload(Profile::Proto).list::<Namespace>(None, &ListQuery::default()).await {
        Ok(p) => p,
        Err(e) => return access_failure("listing namespaces", e),
    };
    let gvr = install_plans_gvr();
    let budget = PageBudget::new(PLAN_PAGE, ctx.clients.budget().max_items);
    let mut stats = PlanStats::default();
    let mut out = TaskOutput::new();
    for ns in namespaces.items.iter().filter_map(|n| n.metadata.name.as_deref()) {
        if ns != "openshift" && !ns.starts_with("openshift-") {
            continue;
        }
        let paged = match ctx.clients.dynamic().list_with(&gvr, Some(ns), &ListQuery::default(), budget).await {
            Ok(p) => p,
            Err(e) => return access_failure("listing installplans", e),
        };
        paged.items.iter().for_each(|p| stats.add(p));
        for w in paged.warnings() {
            out.warn(format!("{ns}: {w}"));
        }
    }
    out.push(Record::new("config/installplans", JsonMarshaller(stats.report(PLAN_ITEMS))));
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OlmOperator {
    pub name: String,
    pub display_name: String,
    pub version: String,
    #[serde(rename = "csv_conditions")]
    pub conditions: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CsvRef {
    name: String,
    namespace: String,
    version: String,
}

fn csv_ref(r: &Value) -> Result<Option<CsvRef>, String> {
    if r.get("kind").and_then(Value::as_str) != Some("ClusterServiceVersion") {
        return Ok(None);
    }
    let name = r.get("name").and_then(Value::as_str).unwrap_or_default();
    let Some((_, version)) = name.split_once('.') else {
        return Err(format!("clusterserviceversion \"{name}\" probably doesn't include version"));
    };
    let namespace = r.get("namespace").and_then(Value::as_str).unwrap_or_default();
    Ok(Some(CsvRef { name: name.to_string(), namespace: namespace.to_string(), version: version.to_string() }))
}

async fn csv_details(ctx: &TaskContext, r: &CsvRef) -> Result<(String, Vec<Value>), String> {
    let csv = match ctx.clients.dynamic().get(&csv_gvr(), Some(&r.namespace), &r.name).await {
        Ok(Some(c)) => c,
        Ok(None) => return Err(format!("failed to get {} ClusterServiceVersion: not found", r.name)),
        Err(e) => return Err(format!("failed to get {} ClusterServiceVersion: {e}", r.name)),
    };
    let conditions = csv.at(&["status", "conditions"]).and_then(Value::as_array).cloned();
    let display = csv.str_at(&["spec", "displayName"]);
    match (display, conditions) {
        (Some(d), Some(c)) => Ok((d.to_string(), c)),
        _ => Err(format!("cannot read {} ClusterServiceVersion attributes", r.name)),
    }
}

pub async fn olm_operators(ctx: TaskContext) -> TaskOutput {
    let listed = match ctx.clients.dynamic().list_all(&operators_gvr(), None, &ListQuery::default()).await {
        Ok(p) => p,
        Err(e) => return access_failure("listing olm operators", e),
    };
    let mut out = TaskOutput::new();
    let mut olms: Vec<OlmOperator> = Vec::new();
    let blank = |name: &str| OlmOperator { name: name.to_string(), display_name: String::new(), version: String::new(), conditions: Vec::new() };
    for op in &listed.items {
        let Some(refs) = op.at(&["status", "components", "refs"]).and_then(Value::as_array) else {
            out.warn(format!("cannot find \"status.components.refs\" in {} definition", op.name()));
            olms.push(blank(op.name()));
            continue;
        };
        for r in refs {
            let found = match csv_ref(r) {
                Ok(Some(f)) => f,
                Ok(None) => continue,
                Err(msg) => {
                    out.warn(msg);
                    olms.push(blank(op.name()));
                    continue;
                }
            };
            let mut entry = OlmOperator { version: found.version.clone(), ..blank(op.name()) };
            match csv_details(&ctx, &found).await {
                Ok((display, conditions)) => {
                    entry.display_name = display;
                    entry.conditions = conditions;
                }
                Err(msg) => {
                    out.warn(msg);
                    olms.push(entry);
                    continue;
                }
            }
            if !olms.iter().any(|o| o.name == entry.name && o.version == entry.version) {
                olms.push(entry);
            }
        }
    }
    if !olms.is_empty() {
        out.push(Record::new("config/olm_operators", JsonMarshaller(olms)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatherSettings;
    use harvest_kubehub::{gvr_of, Clients, MockCluster};
    use std::sync::Arc;

    fn ctx(m: MockCluster) -> TaskContext { TaskContext::new(Clients::new(Arc::new(m)), Arc::new(GatherSettings::default())) }

    fn plan(ns: &str, name: &str, csv: &str) -> Value {
        json!({
            "metadata": {"name": name, "namespace": ns, "generateName": "install-"},
            "spec": {"clusterServiceVersionNames": [csv]}
        })
    }

    #[tokio::test]
    async fn plans_are_grouped_in_openshift_namespaces() {
        let m = MockCluster::new()
            .with(
                &gvr_of::<Namespace>(),
                vec![json!({"metadata": {"name": "openshift-operators"}}), json!({"metadata": {"name": "apps"}})],
            )
            .with(
                &install_plans_gvr(),
                vec![
                    plan("openshift-operators", "install-a1", "etcd.v1"),
                    plan("openshift-operators", "install-b2", "etcd.v1"),
                    plan("openshift-operators", "install-c3", "amq.v2"),
                    plan("apps", "install-d4", "etcd.v1"),
                ],
            );
        let out = install_plans(ctx(m)).await;
        let body: Value = serde_json::from_slice(&out.records[0].marshal().expect("plans")).expect("json");
        assert_eq!(body["stats"]["TOTAL_COUNT"], 3);
        assert_eq!(body["stats"]["TOTAL_NONUNIQ_COUNT"], 2);
        assert_eq!(body["items"][0], json!({"ns": "openshift-operators", "name": "install-", "csv": "etcd.v1", "count": 2}));
    }

    #[tokio::test]
    async fn operators_resolve_their_csv() {
        let m = MockCluster::new()
            .with(
                &operators_gvr(),
                vec![
                    json!({"metadata": {"name": "etcd.openshift-operators"}, "status": {"components": {"refs": [
                        {"kind": "Subscription", "name": "etcd"},
                        {"kind": "ClusterServiceVersion", "name": "etcd.v0.9.4", "namespace": "openshift-operators"}
                    ]}}}),
                    json!({"metadata": {"name": "broken"}}),
                ],
            )
            .with(
                &csv_gvr(),
                vec![json!({
                    "metadata": {"name": "etcd.v0.9.4", "namespace": "openshift-operators"},
                    "spec": {"displayName": "etcd"},
                    "status": {"conditions": [{"phase": "Succeeded"}]}
                })],
            );
        let out = olm_operators(ctx(m)).await;
        let body: Value = serde_json::from_slice(&out.records[0].marshal().expect("olm")).expect("json");
        assert_eq!(body[0]["displayName"], "etcd");
        assert_eq!(body[0]["version"], "v0.9.4");
        assert_eq!(body[0]["csv_conditions"][0]["phase"], "Succeeded");
        assert_eq!(body[1]["name"], "broken");
        assert_eq!(out.warnings().count(), 1);
    }
}
