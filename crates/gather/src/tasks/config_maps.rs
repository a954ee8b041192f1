//! Config maps: everything in `openshift-config`, the monitoring config, and
//! the anonymized install config.

use anyhow::Context;
use bytes::Bytes;
use harvest_anonymize::{ConfigMapAnonymizer, FieldOp};
use harvest_core::{DynamicObject, RawJson, Record, TaskOutput};
use harvest_kubehub::{ListQuery, Profile, WorkloadClient};
use k8s_openapi::api::core::v1::ConfigMap;
use serde_json::Value;

use crate::{access_failure, TaskContext};

fn key_record(ns: &str, name: &str, key: &str) -> String { format!("config/configmaps/{ns}/{name}/{key}") }

async fn openshift_config(workload: &WorkloadClient) -> TaskOutput {
    let ns = "openshift-config";
    let paged = match workload.list::<ConfigMap>(Some(ns), &ListQuery::default()).await {
        Ok(p) => p,
        Err(e) => return access_failure("listing openshift-config configmaps", e),
    };
    let mut out = TaskOutput::new();
    for cm in &paged.items {
        let name = cm.metadata.name.as_deref().unwrap_or_default();
        for (k, v) in cm.data.iter().flatten() {
            out.push(Record::new(key_record(ns, name, k), ConfigMapAnonymizer::text(v)));
        }
        for (k, v) in cm.binary_data.iter().flatten() {
            out.push(Record::new(key_record(ns, name, k), ConfigMapAnonymizer::binary(v.0.clone())));
        }
    }
    for w in paged.warnings() {
        out.warn(w);
    }
    out
}

async fn monitoring_config(workload: &WorkloadClient) -> TaskOutput {
    let (ns, name) = ("openshift-monitoring", "cluster-monitoring-config");
    let cm = match workload.get::<ConfigMap>(Some(ns), name).await {
        Ok(Some(cm)) => cm,
        Ok(None) => return TaskOutput::not_installed(),
        Err(e) => return access_failure("getting cluster-monitoring-config", e),
    };
    let mut out = TaskOutput::new();
    for (k, v) in cm.data.iter().flatten() {
        match yaml_to_json(v) {
            Ok(json) => out.push(Record::new(key_record(ns, name, k.trim_end_matches(".yaml")), RawJson(json))),
            Err(e) => {
                out.fail(format!("{ns}/{name}/{k}: {e:#}"));
                return out;
            }
        }
    }
    out
}

fn yaml_to_json(text: &str) -> anyhow::Result<Bytes> {
    let v: Value = serde_yaml::from_str(text).context("parsing yaml")?;
    Ok(Bytes::from(serde_json::to_vec(&v)?))
}

fn mask_list(root: &mut Value, list: &str, fields: &[&str]) {
    let Some(items) = root.pointer_mut(list).and_then(Value::as_array_mut) else { return };
    for item in items.iter_mut() {
        let mut obj = DynamicObject::new(std::mem::take(item));
        for f in fields {
            FieldOp::anonymize(f).apply(&mut obj);
        }
        *item = obj.into_value();
    }
}

/// Credentials, regions and domains of an install config, masked in place.
pub fn anonymize_install_config(text: &str) -> anyhow::Result<String> {
    let v: Value = serde_yaml::from_str(text).context("parsing install-config")?;
    let mut obj = DynamicObject::new(v);
    for path in [
        "sshKey",
        "pullSecret",
        "baseDomain",
        "platform.aws.region",
        "platform.azure.region",
        "platform.gcp.region",
        "platform.gcp.projectID",
        "platform.gcp.dns.privateZone.projectID",
        "platform.openstack.cloud",
    ] {
        FieldOp::anonymize(path).apply(&mut obj);
    }
    let root = obj.value_mut();
    let fencing = ["hostname", "username", "password", "address"];
    mask_list(root, "/controlPlane/fencing/credentials", &fencing);
    mask_list(root, "/arbiter/fencing/credentials", &fencing);
    if let Some(pools) = root.get_mut("compute").and_then(Value::as_array_mut) {
        for pool in pools.iter_mut() {
            mask_list(pool, "/fencing/credentials", &fencing);
        }
    }
    mask_list(root, "/platform/baremetal/hosts", &["bmc.username", "bmc.password", "bmc.address"]);
    mask_list(root, "/platform/vsphere/failureDomains", &["topology.datacenter"]);
    mask_list(root, "/platform/vsphere/vcenters", &["user", "password"]);
    serde_yaml::to_string(obj.value()).context("encoding install-config")
}

async fn install_config(workload: &WorkloadClient) -> TaskOutput {
    let (ns, name) = ("kube-system", "cluster-config-v1");
    let cm = match workload.get::<ConfigMap>(Some(ns), name).await {
        Ok(Some(cm)) => cm,
        Ok(None) => return TaskOutput::not_installed(),
        Err(e) => return access_failure("getting cluster-config-v1", e),
    };
    let raw = cm.data.as_ref().and_then(|d| d.get("install-config"));
    let text = match raw.map(|s| anonymize_install_config(s)).transpose() {
        Ok(t) => t.unwrap_or_default(),
        Err(e) => return TaskOutput::fatal(format!("{ns}/{name}: {e:#}")),
    };
    TaskOutput::from_records(vec![Record::new(key_record(ns, name, "install-config"), ConfigMapAnonymizer::text(&text))])
}

pub async fn gather(ctx: TaskContext) -> TaskOutput {
    let workload = ctx.clients.workload(Profile::Proto);
    let mut out = openshift_config(&workload).await;
    out.extend(monitoring_config(&workload).await);
    out.extend(install_config(&workload).await);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_config_secrets_are_masked() {
        let text = "\
baseDomain: example.com
sshKey: ssh-rsa AAAA
pullSecret: '{\"auths\":{}}'
platform:
  baremetal:
    hosts:
    - name: h0
      bmc: {username: admin, password: pw, address: 'ipmi://10.0.0.1'}
  vsphere:
    vcenters:
    - server: vc.example.com
      user: root
      password: hunter2
compute:
- name: worker
  fencing:
    credentials:
    - hostname: h1
      password: pw2
";
        let out: Value = serde_yaml::from_str(&anonymize_install_config(text).expect("anonymize")).expect("yaml");
        assert_eq!(out["baseDomain"], "xxxxxxxxxxx");
        assert_eq!(out["sshKey"], "xxxxxxxxxxxx");
        assert_eq!(out["platform"]["baremetal"]["hosts"][0]["bmc"]["password"], "xx");
        assert_eq!(out["platform"]["baremetal"]["hosts"][0]["name"], "h0");
        assert_eq!(out["platform"]["vsphere"]["vcenters"][0]["password"], "xxxxxxx");
        assert_eq!(out["platform"]["vsphere"]["vcenters"][0]["server"], "vc.example.com");
        assert_eq!(out["compute"][0]["fencing"]["credentials"][0]["hostname"], "xx");
    }

    #[test]
    fn monitoring_yaml_becomes_json() {
        let json = yaml_to_json("prometheusK8s:\n  retention: 24h\n").expect("json");
        assert_eq!(&json[..], br#"{"prometheusK8s":{"retention":"24h"}}"#);
        assert!(yaml_to_json(": : :\n- [").is_err());
    }
}
