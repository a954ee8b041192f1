use std::sync::Arc;

use harvest_api::{DirArchive, GatherConfig, HarvestApi, InProcApi, MemoryArchive, MockApi, TaskInfo};
use harvest_gather::Registry;
use harvest_kubehub::{gvr_of, MockCluster};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::storage::v1::StorageClass;
use serde_json::{json, Value};

fn cluster() -> MockCluster {
    MockCluster::new()
        .with(
            &gvr_of::<Node>(),
            vec![json!({
                "metadata": {"name": "worker-0", "labels": {"kubernetes.io/hostname": "worker-0", "team": "payments"}},
                "status": {"nodeInfo": {"bootID": "1234-abcd", "machineID": "m1", "systemUUID": "u1"}, "images": [{"names": ["x"]}]}
            })],
        )
        .with(&gvr_of::<StorageClass>(), vec![json!({"metadata": {"name": "gp3"}, "provisioner": "ebs.csi.aws.com"})])
}

#[tokio::test]
async fn catalog_lists_every_builtin_task() {
    let api = InProcApi::with_access(Arc::new(MockCluster::new()));
    let tasks = api.catalog().await.expect("catalog");
    assert_eq!(tasks.len(), Registry::builtin().len());
    assert!(tasks.iter().any(|t| t.id == "clusterconfig/node_logs"));
    assert!(tasks.iter().any(|t| t.id == "clusterconfig/ingress_logs" && t.kind == "log_harvest"));
}

#[tokio::test]
async fn empty_cluster_run_has_no_failures() {
    let api = InProcApi::with_access(Arc::new(MockCluster::new()));
    let mut archive = MemoryArchive::new(8 * 1024 * 1024);
    let summary = api.gather(&GatherConfig::default(), &[], &mut archive).await.expect("gather");
    assert_eq!(summary.tasks, Registry::builtin().len());
    for r in &summary.reports {
        assert!(r.errors.is_empty(), "{} failed: {:?}", r.name, r.errors);
        assert!(r.panic.is_none() && !r.timed_out, "{}", r.name);
    }
    assert!(archive.get("insights-operator/gathers.json").is_some());
    assert_eq!(api.summary().await.expect("summary"), Some(summary));
}

#[tokio::test]
async fn selected_tasks_land_in_the_archive() {
    let api = InProcApi::with_access(Arc::new(cluster()));
    let mut archive = MemoryArchive::new(1024 * 1024);
    let only = vec!["clusterconfig/nodes".to_string(), "clusterconfig/storage_classes".to_string()];
    let summary = api.gather(&GatherConfig::default(), &only, &mut archive).await.expect("gather");

    assert_eq!(summary.tasks, 2);
    assert_eq!(summary.disabled.len(), Registry::builtin().len() - 2);
    let paths: Vec<&str> = archive.files().iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["config/node/worker-0.json", "config/storage/storageclasses/gp3.json", "insights-operator/gathers.json"]);
    let node: Value = serde_json::from_slice(archive.get("config/node/worker-0.json").expect("node")).expect("json");
    assert_eq!(node["status"]["nodeInfo"]["bootID"], "xxxxxxxxx");
    assert!(node["status"].get("images").is_none());
    let meta: Value = serde_json::from_slice(archive.get("insights-operator/gathers.json").expect("meta")).expect("json");
    assert_eq!(meta["status_reports"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn directory_archive_writes_record_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = InProcApi::with_access(Arc::new(cluster()));
    let mut archive = DirArchive::new(dir.path(), 1024 * 1024);
    let config = GatherConfig { disabled: vec!["clusterconfig/nodes".into()], ..GatherConfig::default() };
    let summary = api.gather(&config, &["clusterconfig/nodes".into(), "clusterconfig/storage_classes".into()], &mut archive).await.expect("gather");
    assert_eq!(summary.archive.written, 2);
    let files = DirArchive::list(dir.path()).expect("list");
    assert_eq!(files, vec!["config/storage/storageclasses/gp3.json", "insights-operator/gathers.json"]);
}

#[tokio::test]
async fn mock_api_serves_canned_answers() {
    let mock = MockApi { tasks: vec![TaskInfo { id: "clusterconfig/dns".into(), kind: "singleton".into() }], summary: None };
    assert_eq!(mock.catalog().await.expect("catalog").len(), 1);
    assert!(mock.summary().await.expect("summary").is_none());
    let mut archive = MemoryArchive::new(10);
    assert!(mock.gather(&GatherConfig::default(), &[], &mut archive).await.is_err());
}
