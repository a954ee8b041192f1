//! Data-driven catalog entries and their interpreter.
//!
//! An entry names the resource coordinates, how records are named, and how
//! each item is shaped. [`CatalogEntry::run`] does the listing, paging,
//! limits and warning bookkeeping the same way for all of them.

use std::sync::Arc;

use harvest_anonymize::FieldOp;
use harvest_core::{DynamicObject, Gvr, JsonMarshaller, NestedPath, Record, RecordName, ResourceMarshaller, TaskOutput};
use harvest_kubehub::handles::CONFIG_GROUP;
use harvest_kubehub::{ListQuery, Paged};
use harvest_logs::{collect_logs_from_containers, ContainerFilter, MessageFilter, NameBuilder};
use serde_json::{json, Value};
use tracing::debug;

use crate::shape::{last_applied, Shape};
use crate::{access_failure, TaskContext, TaskEntry, TaskKind};

/// How a record name is derived from an item.
#[derive(Debug, Clone)]
pub enum Naming {
    Record(RecordName),
    /// `<prefix>/<string at path>`
    Field { prefix: String, path: NestedPath },
    /// `<prefix>/<namespace>/<segment>/<name>`
    Grouped { prefix: String, segment: String },
}

impl Naming {
    pub fn cluster(prefix: &str) -> Self { Naming::Record(RecordName::cluster(prefix)) }
    pub fn namespaced(prefix: &str) -> Self { Naming::Record(RecordName::namespaced(prefix)) }
    pub fn fixed(name: &str) -> Self { Naming::Record(RecordName::fixed(name)) }

    /// `None` when the naming field is missing or empty.
    pub fn render(&self, gvr: &Gvr, obj: &DynamicObject) -> Option<String> {
        match self {
            Naming::Record(r) => Some(r.render(gvr, obj)),
            Naming::Field { prefix, path } => obj.get_str(path).filter(|s| !s.is_empty()).map(|v| format!("{prefix}/{v}")),
            Naming::Grouped { prefix, segment } => {
                Some(format!("{prefix}/{}/{segment}/{}", obj.namespace().unwrap_or_default(), obj.name()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStyle {
    /// `found N resources, limit (M) reached`
    Found,
    /// `limit M for number of gathered <resource> resources exceeded`
    Exceeded,
}

/// Most items a task emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub max: usize,
    pub style: LimitStyle,
}

impl Limit {
    pub fn found(max: usize) -> Self { Self { max, style: LimitStyle::Found } }
    pub fn exceeded(max: usize) -> Self { Self { max, style: LimitStyle::Exceeded } }

    pub fn message(&self, resource: &str, total: usize) -> String {
        match self.style {
            LimitStyle::Found => format!("found {total} resources, limit ({}) reached", self.max),
            LimitStyle::Exceeded => format!("limit {} for number of gathered {resource} resources exceeded", self.max),
        }
    }

    /// Keep the first `max` items; the warning carries the observed count.
    pub fn apply<T>(&self, resource: &str, mut items: Vec<T>) -> (Vec<T>, Option<String>) {
        if items.len() <= self.max {
            return (items, None);
        }
        let total = items.len();
        items.truncate(self.max);
        (items, Some(self.message(resource, total)))
    }
}

/// Named objects of one kind; absent ones are skipped.
#[derive(Debug, Clone)]
pub struct SingletonSpec {
    pub gvr: Gvr,
    pub objects: Vec<String>,
    pub namespace: Option<String>,
    pub naming: Naming,
    pub shape: Shape,
}

#[derive(Debug, Clone)]
pub enum Emit {
    PerItem(Naming),
    /// One JSON record holding a summary of every item.
    Aggregate { record: String, item: fn(&DynamicObject) -> Value },
}

#[derive(Debug, Clone)]
pub struct ListSpec {
    pub gvr: Gvr,
    pub namespace: Option<String>,
    pub labels: Option<String>,
    pub emit: Emit,
    pub shape: Shape,
    pub limit: Option<Limit>,
}

impl ListSpec {
    pub fn new(gvr: Gvr, naming: Naming) -> Self {
        Self {
            gvr,
            namespace: None,
            labels: None,
            emit: Emit::PerItem(naming),
            shape: Shape::none(),
            limit: None,
        }
    }

    pub fn aggregate(gvr: Gvr, record: &str, item: fn(&DynamicObject) -> Value) -> Self {
        Self { emit: Emit::Aggregate { record: record.to_string(), item }, ..Self::new(gvr, Naming::fixed(record)) }
    }

    pub fn namespace(mut self, ns: &str) -> Self {
        self.namespace = Some(ns.to_string());
        self
    }

    pub fn labels(mut self, sel: &str) -> Self {
        self.labels = Some(sel.to_string());
        self
    }

    pub fn shape(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }

    pub fn limit(mut self, limit: Limit) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Clone)]
pub struct LogSpec {
    pub containers: ContainerFilter,
    pub messages: MessageFilter,
    pub names: Option<NameBuilder>,
}

impl std::fmt::Debug for LogSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSpec").field("containers", &self.containers).field("messages", &self.messages).finish()
    }
}

#[derive(Debug, Clone)]
pub enum Spec {
    Singleton(SingletonSpec),
    List(ListSpec),
    Logs(LogSpec),
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub spec: Spec,
    /// Skip the task unless an object of this kind exists.
    pub marker: Option<Gvr>,
}

impl CatalogEntry {
    pub fn new(name: &'static str, spec: Spec) -> Self { Self { name, spec, marker: None } }

    pub fn gated(mut self, marker: Gvr) -> Self {
        self.marker = Some(marker);
        self
    }

    pub fn kind(&self) -> TaskKind {
        if self.marker.is_some() {
            return TaskKind::Conditional;
        }
        match &self.spec {
            Spec::Singleton(_) => TaskKind::Singleton,
            Spec::List(l) if l.shape.is_identity() => TaskKind::List,
            Spec::List(_) => TaskKind::ListShaped,
            Spec::Logs(_) => TaskKind::LogHarvest,
        }
    }

    pub async fn run(&self, ctx: &TaskContext) -> TaskOutput {
        match &self.spec {
            Spec::Singleton(s) => run_singleton(s, ctx).await,
            Spec::List(l) => run_list(l, ctx).await,
            Spec::Logs(l) => collect_logs_from_containers(&ctx.clients, &l.containers, &l.messages, l.names.as_ref()).await,
        }
    }

    pub fn into_task(self) -> TaskEntry {
        let marker = self.marker.clone();
        let kind = self.kind();
        let entry = Arc::new(self);
        let task = TaskEntry::new(entry.name, kind, move |ctx| {
            let entry = entry.clone();
            async move { entry.run(&ctx).await }
        });
        match marker {
            Some(m) => task.gated(m),
            None => task,
        }
    }
}

async fn run_singleton(spec: &SingletonSpec, ctx: &TaskContext) -> TaskOutput {
    let mut out = TaskOutput::new();
    let dynamic = ctx.clients.dynamic();
    for name in &spec.objects {
        match dynamic.get(&spec.gvr, spec.namespace.as_deref(), name).await {
            Ok(Some(obj)) => match spec.naming.render(&spec.gvr, &obj) {
                Some(record) => out.push(Record::new(record, ResourceMarshaller(spec.shape.apply(obj)))),
                None => out.warn(format!("skipping {} {name}: no record name", spec.gvr)),
            },
            Ok(None) => debug!(gvr = %spec.gvr, name = %name, "catalog: object absent"),
            Err(e) => {
                out.extend(access_failure(&format!("getting {} {name}", spec.gvr), e));
                return out;
            }
        }
    }
    out
}

/// Listing under the run budget with the item limit applied.
pub async fn list_limited(
    ctx: &TaskContext,
    gvr: &Gvr,
    namespace: Option<&str>,
    query: &ListQuery,
    limit: Option<Limit>,
) -> Result<(Vec<DynamicObject>, Vec<String>), harvest_kubehub::AccessError> {
    let paged: Paged<DynamicObject> = ctx.clients.dynamic().list_all(gvr, namespace, query).await?;
    let mut warnings = paged.warnings();
    let items = match limit {
        Some(l) => {
            let (kept, warning) = l.apply(&gvr.resource, paged.items);
            warnings.extend(warning);
            kept
        }
        None => paged.items,
    };
    Ok((items, warnings))
}

async fn run_list(spec: &ListSpec, ctx: &TaskContext) -> TaskOutput {
    let query = ListQuery { label_selector: spec.labels.clone(), ..Default::default() };
    let listed = list_limited(ctx, &spec.gvr, spec.namespace.as_deref(), &query, spec.limit).await;
    let (items, warnings) = match listed {
        Ok(l) => l,
        Err(e) => return access_failure(&format!("listing {}", spec.gvr), e),
    };
    let mut out = TaskOutput::new();
    match &spec.emit {
        Emit::PerItem(naming) => {
            for obj in items {
                match naming.render(&spec.gvr, &obj) {
                    Some(name) => out.push(Record::new(name, ResourceMarshaller(spec.shape.apply(obj)))),
                    None => out.warn(format!(
                        "skipping {} {}/{}: no record name",
                        spec.gvr,
                        obj.namespace().unwrap_or_default(),
                        obj.name()
                    )),
                }
            }
        }
        Emit::Aggregate { record, item } => {
            let summary: Vec<Value> = items.iter().map(item).collect();
            out.push(Record::new(record.clone(), JsonMarshaller(summary)));
        }
    }
    for w in warnings {
        out.warn(w);
    }
    out
}

fn is_product_key(k: &str) -> bool {
    k.contains("openshift.io/") || k.contains("k8s.io/") || k.contains("kubernetes.io/")
}

fn shape_node(o: &mut DynamicObject) {
    let meta = o.value_mut().get_mut("metadata").and_then(Value::as_object_mut);
    let Some(meta) = meta else { return };
    if let Some(ann) = meta.get_mut("annotations").and_then(Value::as_object_mut) {
        for (k, v) in ann.iter_mut() {
            if !is_product_key(k) {
                *v = Value::String(String::new());
            }
        }
    }
    if let Some(labels) = meta.get_mut("labels").and_then(Value::as_object_mut) {
        for (k, v) in labels.iter_mut() {
            if let (false, Some(s)) = (is_product_key(k), v.as_str()) {
                *v = Value::String(harvest_anonymize::string(s));
            }
        }
    }
}

fn for_each_in_list(o: &mut DynamicObject, list: &[&str], mut f: impl FnMut(&mut serde_json::Map<String, Value>)) {
    let segs: Vec<String> = list.iter().map(|s| s.to_string()).collect();
    let Some(items) = harvest_core::resource::lookup_mut(o.value_mut(), &segs).and_then(Value::as_array_mut) else {
        return;
    };
    for it in items.iter_mut().filter_map(Value::as_object_mut) {
        f(it);
    }
}

pub(crate) fn shape_webhooks(o: &mut DynamicObject) {
    for_each_in_list(o, &["webhooks"], |hook| {
        let bundle = hook.get_mut("clientConfig").and_then(|c| c.get_mut("caBundle"));
        if let Some(Value::String(s)) = bundle {
            *s = harvest_anonymize::string(s);
        }
    });
}

fn shape_machine_set(o: &mut DynamicObject) {
    for_each_in_list(o, &["spec", "template", "spec", "providerSpec", "value", "serviceAccounts"], |sa| {
        if let Some(Value::String(email)) = sa.get_mut("email") {
            *email = harvest_anonymize::string(email);
        }
    });
}

fn shape_vmi(o: &mut DynamicObject) {
    for_each_in_list(o, &["spec", "volumes"], |vol| {
        if vol.contains_key("cloudInitNoCloud") {
            vol.insert("cloudInitNoCloud".into(), Value::String(String::new()));
        }
    });
}

fn shape_node_set(o: &mut DynamicObject) {
    let hosts = o.value_mut().pointer_mut("/status/allHostnames").and_then(Value::as_object_mut);
    let Some(hosts) = hosts else { return };
    for networks in hosts.values_mut().filter_map(Value::as_object_mut) {
        for hostname in networks.values_mut() {
            if let Value::String(s) = hostname {
                *s = harvest_anonymize::string(s);
            }
        }
    }
}

fn netnamespace_summary(o: &DynamicObject) -> Value {
    json!({
        "name": o.name(),
        "netID": o.at(&["netid"]).cloned().unwrap_or(Value::Null),
        "egressIPs": o.at(&["egressIPs"]).cloned().unwrap_or(Value::Null),
    })
}

pub fn config_gvr(resource: &str) -> Gvr { Gvr::new(CONFIG_GROUP, "v1", resource) }

fn config_singleton(name: &'static str, resource: &str, record: &str, shape: Shape) -> CatalogEntry {
    CatalogEntry::new(
        name,
        Spec::Singleton(SingletonSpec {
            gvr: config_gvr(resource),
            objects: vec!["cluster".into()],
            namespace: None,
            naming: Naming::fixed(record),
            shape,
        }),
    )
}

fn named(name: &'static str, gvr: Gvr, objects: &[&str], naming: Naming) -> CatalogEntry {
    CatalogEntry::new(
        name,
        Spec::Singleton(SingletonSpec {
            gvr,
            objects: objects.iter().map(|s| s.to_string()).collect(),
            namespace: None,
            naming,
            shape: Shape::none(),
        }),
    )
}

fn list(name: &'static str, spec: ListSpec) -> CatalogEntry { CatalogEntry::new(name, Spec::List(spec)) }

fn logs(name: &'static str, containers: ContainerFilter, messages: MessageFilter) -> CatalogEntry {
    CatalogEntry::new(name, Spec::Logs(LogSpec { containers, messages, names: None }))
}

pub fn ceph_clusters() -> Gvr { Gvr::new("ceph.rook.io", "v1", "cephclusters") }

/// Every data-only task.
pub fn builtin() -> Vec<CatalogEntry> {
    let mut v = vec![
        config_singleton("infrastructures", "infrastructures", "config/infrastructure", Shape::ops(vec![FieldOp::url("status.infrastructureName")])),
        config_singleton("networks", "networks", "config/network", Shape::none()),
        config_singleton("authentication", "authentications", "config/authentication", Shape::none()),
        config_singleton("feature_gates", "featuregates", "config/featuregate", Shape::none()),
        config_singleton("oauths", "oauths", "config/oauth", Shape::none()),
        config_singleton("ingress", "ingresses", "config/ingress", Shape::none()),
        config_singleton("image", "images", "config/image", Shape::none()),
        config_singleton("dns", "dnses", "config/dns", Shape::none()),
        config_singleton(
            "proxies",
            "proxies",
            "config/proxy",
            Shape::ops(vec![
                FieldOp::url_csv("spec.httpProxy"),
                FieldOp::url_csv("spec.httpsProxy"),
                FieldOp::url_csv("spec.noProxy"),
                FieldOp::url("spec.readinessEndpoints"),
                FieldOp::url_csv("status.httpProxy"),
                FieldOp::url_csv("status.httpsProxy"),
                FieldOp::url_csv("status.noProxy"),
            ]),
        ),
        named(
            "image_pruners",
            Gvr::new("imageregistry.operator.openshift.io", "v1", "imagepruners"),
            &["cluster"],
            Naming::fixed("config/clusteroperator/imageregistry.operator.openshift.io/imagepruner/cluster"),
        ),
        named(
            "crds",
            Gvr::new("apiextensions.k8s.io", "v1", "customresourcedefinitions"),
            &["volumesnapshots.snapshot.storage.k8s.io", "volumesnapshotcontents.snapshot.storage.k8s.io"],
            Naming::cluster("config/crd"),
        ),
        named(
            "cluster_roles",
            Gvr::new("rbac.authorization.k8s.io", "v1", "clusterroles"),
            &["admin", "edit"],
            Naming::Record(RecordName::ClusterScopedResource),
        ),
        list(
            "nodes",
            ListSpec::new(Gvr::new("", "v1", "nodes"), Naming::cluster("config/node")).shape(
                Shape::custom(shape_node).with_ops(vec![
                    FieldOp::anonymize("status.nodeInfo.bootID"),
                    FieldOp::anonymize("status.nodeInfo.systemUUID"),
                    FieldOp::anonymize("status.nodeInfo.machineID"),
                    FieldOp::remove("status.images"),
                ]),
            ),
        ),
        list(
            "host_subnets",
            ListSpec::new(
                Gvr::new("network.openshift.io", "v1", "hostsubnets"),
                Naming::Field { prefix: "config/hostsubnet".into(), path: NestedPath::dotted("host") },
            ),
        ),
        list(
            "netnamespaces",
            ListSpec::aggregate(Gvr::new("network.openshift.io", "v1", "netnamespaces"), "config/netnamespaces", netnamespace_summary),
        ),
        list(
            "machine_sets",
            ListSpec::new(Gvr::new("machine.openshift.io", "v1beta1", "machinesets"), Naming::namespaced("config/machinesets")).shape(
                Shape::custom(shape_machine_set).with_ops(vec![
                    FieldOp::anonymize("spec.template.spec.providerSpec.value.projectID"),
                    FieldOp::anonymize("spec.template.spec.providerSpec.value.region"),
                    FieldOp::anonymize("spec.template.spec.providerSpec.value.placement.availabilityZone"),
                    FieldOp::anonymize("spec.template.spec.providerSpec.value.placement.region"),
                ]),
            ),
        ),
        list(
            "machine_config_pools",
            ListSpec::new(Gvr::new("machineconfiguration.openshift.io", "v1", "machineconfigpools"), Naming::cluster("config/machineconfigpools")),
        ),
        list(
            "container_runtime_configs",
            ListSpec::new(
                Gvr::new("machineconfiguration.openshift.io", "v1", "containerruntimeconfigs"),
                Naming::cluster("config/containerruntimeconfigs"),
            ),
        ),
        list(
            "machine_healthchecks",
            ListSpec::new(Gvr::new("machine.openshift.io", "v1beta1", "machinehealthchecks"), Naming::namespaced("config/machinehealthchecks")),
        ),
        list(
            "machine_autoscalers",
            ListSpec::new(Gvr::new("autoscaling.openshift.io", "v1beta1", "machineautoscalers"), Naming::namespaced("config/machineautoscalers")),
        ),
        list("schedulers", ListSpec::new(config_gvr("schedulers"), Naming::cluster("config/schedulers"))),
        list(
            "storage_classes",
            ListSpec::new(Gvr::new("storage.k8s.io", "v1", "storageclasses"), Naming::cluster("config/storage/storageclasses")),
        ),
        list(
            "storage_cluster",
            ListSpec::new(
                Gvr::new("ocs.openshift.io", "v1", "storageclusters"),
                Naming::Grouped { prefix: "config/storage".into(), segment: "storageclusters".into() },
            ),
        ),
        list(
            "ceph_cluster",
            ListSpec::new(ceph_clusters(), Naming::namespaced("config/storage")).shape(Shape::project("status")),
        ),
        list(
            "openshift_logging",
            ListSpec::new(Gvr::new("logging.openshift.io", "v1", "clusterloggings"), Naming::namespaced("config/logging")),
        ),
        list(
            "jaegers",
            ListSpec::new(Gvr::new("jaegertracing.io", "v1", "jaegers"), Naming::cluster("config/jaegertracing.io")).limit(Limit::exceeded(5)),
        ),
        list(
            "tempo_stacks",
            ListSpec::new(Gvr::new("tempo.grafana.com", "v1alpha1", "tempostacks"), Naming::namespaced("config/tempo.grafana.com"))
                .limit(Limit::exceeded(5)),
        ),
        list(
            "virtual_machine_instances",
            ListSpec::new(Gvr::new("kubevirt.io", "v1", "virtualmachineinstances"), Naming::namespaced("config/virtualmachineinstances"))
                .shape(Shape::custom(shape_vmi))
                .limit(Limit::exceeded(5)),
        ),
        list(
            "cost_management_metrics_configs",
            ListSpec::new(
                Gvr::new("costmanagement-metrics-cfg.openshift.io", "v1beta1", "costmanagementmetricsconfigs"),
                Naming::cluster("config/cost_management_metrics_configs"),
            ),
        ),
        list(
            "nodenetworkconfigurationpolicies",
            ListSpec::new(Gvr::new("nmstate.io", "v1", "nodenetworkconfigurationpolicies"), Naming::Record(RecordName::ClusterScopedResource)),
        ),
        list(
            "nodenetworkstates",
            ListSpec::new(Gvr::new("nmstate.io", "v1beta1", "nodenetworkstates"), Naming::Record(RecordName::ClusterScopedResource)),
        ),
        list(
            "openstack_controlplanes",
            ListSpec::new(Gvr::new("core.openstack.org", "v1beta1", "openstackcontrolplanes"), Naming::Record(RecordName::NamespacedResource))
                .shape(Shape::ops(vec![last_applied(), FieldOp::anonymize("spec.dns.template.options")])),
        ),
        list(
            "openstack_dataplanenodesets",
            ListSpec::new(
                Gvr::new("dataplane.openstack.org", "v1beta1", "openstackdataplanenodesets"),
                Naming::Record(RecordName::NamespacedResource),
            )
            .shape(
                Shape::custom(shape_node_set).with_ops(vec![
                    last_applied(),
                    FieldOp::recursive(&["ansibleHost", "ansibleUser", "edpm_sshd_allowed_ranges", "dnsClusterAddresses"]),
                ]),
            ),
        ),
        list(
            "openstack_dataplanedeployments",
            ListSpec::new(
                Gvr::new("dataplane.openstack.org", "v1beta1", "openstackdataplanedeployments"),
                Naming::Record(RecordName::NamespacedResource),
            )
            .shape(Shape::ops(vec![last_applied()])),
        ),
        list(
            "openstack_versions",
            ListSpec::new(Gvr::new("core.openstack.org", "v1beta1", "openstackversions"), Naming::Record(RecordName::NamespacedResource)),
        ),
        list(
            "subscriptions",
            ListSpec::new(Gvr::new("operators.coreos.com", "v1alpha1", "subscriptions"), Naming::cluster("config/subscriptions"))
                .shape(Shape::ops(vec![FieldOp::remove("status")])),
        ),
    ];
    v.extend(log_harvests());
    v
}

fn log_harvests() -> Vec<CatalogEntry> {
    let scheduler_names: NameBuilder = Arc::new(|ns, pod, _| format!("config/pod/{ns}/logs/{pod}/messages.log"));
    vec![
        logs(
            "openshift_apiserver_operator_logs",
            ContainerFilter::namespace("openshift-apiserver-operator").labels("app=openshift-apiserver-operator"),
            MessageFilter::substrings(&[
                "the server has received too many requests and has asked us",
                "because serving request timed out and response had been started",
            ]),
        ),
        logs(
            "openshift_authentication_logs",
            ContainerFilter::namespace("openshift-authentication").labels("app=oauth-openshift"),
            MessageFilter::substrings(&["AuthenticationError: invalid resource name"]),
        ),
        logs(
            "openshift_sdn_logs",
            ContainerFilter::namespace("openshift-sdn").labels("app=sdn"),
            MessageFilter::substrings(&[
                "Got OnEndpointsUpdate for unknown Endpoints",
                "Got OnEndpointsDelete for unknown Endpoints",
                "Unable to update proxy firewall for policy",
                "Failed to update proxy firewall for policy",
            ]),
        ),
        logs(
            "openshift_sdn_controller_logs",
            ContainerFilter::namespace("openshift-sdn").labels("app=sdn-controller"),
            MessageFilter::regex(&[
                r"Node.+is not Ready",
                r"Node.+may be offline\.\.\. retrying",
                r"Node.+is offline",
                r"Node.+is back online",
            ]),
        ),
        logs(
            "kube_controller_manager_logs",
            ContainerFilter::namespace("openshift-kube-controller-manager")
                .labels("app=kube-controller-manager")
                .containers("kube-controller-manager"),
            MessageFilter::regex(&[
                "Internal error occurred: error resolving resource",
                "syncing garbage collector with updated resources from discovery",
            ])
            .limit_bytes(5 * 64 * 1024),
        ),
        CatalogEntry::new(
            "scheduler_logs",
            Spec::Logs(LogSpec {
                containers: ContainerFilter::namespace("openshift-kube-scheduler").labels("app=openshift-kube-scheduler"),
                messages: MessageFilter::substrings(&["PodTopologySpread"]),
                names: Some(scheduler_names),
            }),
        ),
        logs(
            "ingress_logs",
            ContainerFilter::namespace("openshift-ingress"),
            MessageFilter::regex(&[r"E\d+\s", r"W\d+\s.*error.*"]),
        ),
        logs(
            "kube_apiserver_logs",
            ContainerFilter::namespace("openshift-kube-apiserver").labels("app=openshift-kube-apiserver").containers("^kube-apiserver$"),
            MessageFilter::regex(&[r"E\d+\s.*", r"W\d+\s.*error.*"]),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatherSettings;
    use harvest_kubehub::{Clients, MockCluster};

    fn ctx(m: MockCluster) -> TaskContext { TaskContext::new(Clients::new(Arc::new(m)), Arc::new(GatherSettings::default())) }

    fn entry(name: &str) -> CatalogEntry {
        builtin().into_iter().find(|e| e.name == name).unwrap_or_else(|| panic!("no catalog entry {name}"))
    }

    fn body(r: &Record) -> Value { serde_json::from_slice(&r.marshal().expect("marshal")).expect("json") }

    #[test]
    fn kinds_follow_the_spec_shape() {
        assert_eq!(entry("networks").kind(), TaskKind::Singleton);
        assert_eq!(entry("schedulers").kind(), TaskKind::List);
        assert_eq!(entry("nodes").kind(), TaskKind::ListShaped);
        assert_eq!(entry("ingress_logs").kind(), TaskKind::LogHarvest);
    }

    #[test]
    fn limit_keeps_prefix_and_reports() {
        let (kept, w) = Limit::exceeded(2).apply("jaegers", vec![1, 2, 3]);
        assert_eq!(kept, vec![1, 2]);
        assert_eq!(w.as_deref(), Some("limit 2 for number of gathered jaegers resources exceeded"));
        assert_eq!(Limit::found(5).apply("x", vec![1]).1, None);
    }

    #[tokio::test]
    async fn unserved_kind_is_silent() {
        for name in ["nodes", "jaegers", "networks", "netnamespaces"] {
            let out = entry(name).run(&ctx(MockCluster::new())).await;
            assert!(out.is_empty(), "{name} should be silent");
        }
    }

    #[tokio::test]
    async fn singleton_is_shaped_and_named() {
        let m = MockCluster::new().with(
            &config_gvr("proxies"),
            vec![json!({
                "metadata": {"name": "cluster"},
                "spec": {"httpProxy": "http://user:pw@proxy.corp:3128", "noProxy": "a.corp,10.0.0.0/8"}
            })],
        );
        let out = entry("proxies").run(&ctx(m)).await;
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].path(), "config/proxy.json");
        let v = body(&out.records[0]);
        assert_eq!(v["spec"]["httpProxy"], "xxxx://xxxx:xxxxxxxx.xxxx:xxxx");
        assert_eq!(v["spec"]["noProxy"], "x.xxxx,xx.x.x.x/x");
    }

    #[tokio::test]
    async fn nodes_keep_product_keys_only() {
        let m = MockCluster::new().with(
            &Gvr::new("", "v1", "nodes"),
            vec![json!({
                "metadata": {
                    "name": "master-0",
                    "labels": {"node-role.kubernetes.io/master": "", "team": "blue"},
                    "annotations": {"machineconfiguration.openshift.io/state": "Done", "owner": "alice"}
                },
                "status": {"nodeInfo": {"bootID": "abc", "machineID": "m1"}, "images": [{"names": ["x"]}]}
            })],
        );
        let out = entry("nodes").run(&ctx(m)).await;
        let v = body(&out.records[0]);
        assert_eq!(out.records[0].name, "config/node/master-0");
        assert_eq!(v["metadata"]["labels"]["team"], "xxxx");
        assert_eq!(v["metadata"]["annotations"]["owner"], "");
        assert_eq!(v["metadata"]["annotations"]["machineconfiguration.openshift.io/state"], "Done");
        assert_eq!(v["status"]["nodeInfo"]["bootID"], "xxx");
        assert!(v["status"].get("images").is_none());
    }

    #[tokio::test]
    async fn jaegers_over_limit_warn() {
        let gvr = Gvr::new("jaegertracing.io", "v1", "jaegers");
        let m = MockCluster::new().with(&gvr, (0..6).map(|i| json!({"metadata": {"name": format!("j{i}"), "namespace": "obs"}})));
        let out = entry("jaegers").run(&ctx(m)).await;
        assert_eq!(out.records.len(), 5);
        assert_eq!(out.records[0].name, "config/jaegertracing.io/j0");
        assert_eq!(out.warnings().collect::<Vec<_>>(), vec!["limit 5 for number of gathered jaegers resources exceeded"]);
    }

    #[tokio::test]
    async fn host_subnets_named_by_host() {
        let gvr = Gvr::new("network.openshift.io", "v1", "hostsubnets");
        let m = MockCluster::new().with(
            &gvr,
            vec![json!({"metadata": {"name": "a"}, "host": "worker-0"}), json!({"metadata": {"name": "b"}})],
        );
        let out = entry("host_subnets").run(&ctx(m)).await;
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].name, "config/hostsubnet/worker-0");
        assert_eq!(out.warnings().count(), 1);
    }

    #[tokio::test]
    async fn netnamespaces_aggregate() {
        let gvr = Gvr::new("network.openshift.io", "v1", "netnamespaces");
        let m = MockCluster::new().with(&gvr, vec![json!({"metadata": {"name": "ns1"}, "netid": 7, "egressIPs": ["10.0.0.1"]})]);
        let out = entry("netnamespaces").run(&ctx(m)).await;
        assert_eq!(out.records.len(), 1);
        assert_eq!(body(&out.records[0]), json!([{"name": "ns1", "netID": 7, "egressIPs": ["10.0.0.1"]}]));
    }

    #[tokio::test]
    async fn openstack_node_sets_are_scrubbed() {
        let gvr = Gvr::new("dataplane.openstack.org", "v1beta1", "openstackdataplanenodesets");
        let m = MockCluster::new().with(
            &gvr,
            vec![json!({
                "metadata": {"name": "edpm", "namespace": "openstack",
                    "annotations": {"kubectl.kubernetes.io/last-applied-configuration": "{..}"}},
                "spec": {"nodes": {"edpm-0": {"ansible": {"ansibleHost": "192.168.1.2", "ansibleUser": "root"}}}},
                "status": {"allHostnames": {"edpm-0": {"ctlplane": "edpm-0.example.com"}}}
            })],
        );
        let out = entry("openstack_dataplanenodesets").run(&ctx(m)).await;
        assert_eq!(out.records[0].name, "namespaces/openstack/dataplane.openstack.org/openstackdataplanenodesets/edpm");
        let v = body(&out.records[0]);
        assert_eq!(v["spec"]["nodes"]["edpm-0"]["ansible"]["ansibleHost"], "xxxxxxxxxxx");
        assert_eq!(v["status"]["allHostnames"]["edpm-0"]["ctlplane"], "xxxxxxxxxxxxxxxxxx");
        assert!(v["metadata"]["annotations"].as_object().is_some_and(|a| a.is_empty()));
    }
}
