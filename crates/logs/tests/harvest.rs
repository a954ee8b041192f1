use std::sync::Arc;

use harvest_kubehub::{gvr_of, Clients, MockCluster};
use harvest_logs::{collect_logs_from_containers, ContainerFilter, MessageFilter, NameBuilder};
use k8s_openapi::api::core::v1::Pod;
use serde_json::{json, Value};

fn pod(ns: &str, name: &str, app: &str, containers: &[&str]) -> Value {
    let cs: Vec<Value> = containers.iter().map(|c| json!({"name": c})).collect();
    json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {"name": name, "namespace": ns, "labels": {"app": app}},
        "spec": {"containers": cs}
    })
}

#[tokio::test]
async fn keeps_only_matching_lines() {
    let m = MockCluster::new()
        .with(&gvr_of::<Pod>(), vec![pod("openshift-kube-controller-manager", "kcm-1", "kube-controller-manager", &["kube-controller-manager"])])
        .with_logs(
            "openshift-kube-controller-manager",
            "kcm-1",
            "kube-controller-manager",
            "foo\nInternal error occurred: error resolving resource X\nbar\n",
        );
    let clients = Clients::new(Arc::new(m));
    let out = collect_logs_from_containers(
        &clients,
        &ContainerFilter::namespace("openshift-kube-controller-manager").labels("app=kube-controller-manager"),
        &MessageFilter::substrings(&["Internal error occurred: error resolving resource"]),
        None,
    )
    .await;
    assert!(out.outcomes.is_empty());
    assert_eq!(out.records.len(), 1);
    let r = &out.records[0];
    assert_eq!(r.name, "config/pod/openshift-kube-controller-manager/logs/kcm-1/errors.log");
    let text = String::from_utf8(r.marshal().expect("marshal")).expect("utf8");
    assert_eq!(text, "Internal error occurred: error resolving resource X");
}

#[tokio::test]
async fn no_pods_is_empty_and_silent() {
    let m = MockCluster::new().serve(&gvr_of::<Pod>());
    let out = collect_logs_from_containers(
        &Clients::new(Arc::new(m)),
        &ContainerFilter::namespace("openshift-sdn"),
        &MessageFilter::substrings(&["x"]),
        None,
    )
    .await;
    assert!(out.is_empty());
}

#[tokio::test]
async fn failed_container_becomes_warning() {
    let m = MockCluster::new()
        .with(&gvr_of::<Pod>(), vec![pod("openshift-sdn", "sdn-a", "sdn", &["sdn", "kube-rbac-proxy"])])
        .with_logs("openshift-sdn", "sdn-a", "sdn", "Got OnEndpointsUpdate for unknown Endpoints foo\n");
    let names: NameBuilder = Arc::new(|ns, pod, c| format!("config/pod/{ns}/logs/{pod}/{c}.log"));
    let out = collect_logs_from_containers(
        &Clients::new(Arc::new(m)),
        &ContainerFilter::namespace("openshift-sdn").labels("app=sdn"),
        &MessageFilter::substrings(&["got onendpointsupdate"]),
        Some(&names),
    )
    .await;
    assert_eq!(out.records.len(), 1);
    assert_eq!(out.records[0].name, "config/pod/openshift-sdn/logs/sdn-a/sdn.log");
    let warnings: Vec<&str> = out.warnings().collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("openshift-sdn/sdn-a/kube-rbac-proxy"));
}

#[tokio::test]
async fn container_regex_and_byte_limit() {
    let long = "E0101 failure happened here\n".repeat(50);
    let m = MockCluster::new()
        .with(&gvr_of::<Pod>(), vec![pod("openshift-kube-apiserver", "kas", "openshift-kube-apiserver", &["kube-apiserver", "kube-apiserver-cert-syncer"])])
        .with_logs("openshift-kube-apiserver", "kas", "kube-apiserver", long)
        .with_logs("openshift-kube-apiserver", "kas", "kube-apiserver-cert-syncer", "E0101 not wanted\n");
    let clients = Clients::new(Arc::new(m.clone()));
    let out = collect_logs_from_containers(
        &clients,
        &ContainerFilter::namespace("openshift-kube-apiserver").containers("^kube-apiserver$"),
        &MessageFilter::regex(&[r"E\d+\s.*"]).limit_bytes(100),
        None,
    )
    .await;
    assert_eq!(out.records.len(), 1);
    let bytes = out.records[0].marshal().expect("marshal");
    assert!(bytes.len() <= 100);
    assert!(!m.calls().iter().any(|c| c.contains("cert-syncer")));
}

#[tokio::test]
async fn namespace_container_cap_is_reported() {
    let pods: Vec<Value> = (0..3).map(|i| pod("ns", &format!("p{i}"), "a", &["c"])).collect();
    let mut m = MockCluster::new().with(&gvr_of::<Pod>(), pods);
    for i in 0..3 {
        m = m.with_logs("ns", &format!("p{i}"), "c", "match\n");
    }
    let filter = ContainerFilter { max_namespace_containers: 2, ..ContainerFilter::namespace("ns") };
    let out = collect_logs_from_containers(&Clients::new(Arc::new(m)), &filter, &MessageFilter::substrings(&["match"]), None).await;
    assert_eq!(out.records.len(), 2);
    assert_eq!(out.warnings().collect::<Vec<_>>(), vec!["skipping 1 containers on namespace ns (max: 2)"]);
}
