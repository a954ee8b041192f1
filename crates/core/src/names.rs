//! Record-name layout. Consumers depend on these prefixes.

use serde::{Deserialize, Serialize};

use crate::resource::{DynamicObject, Gvr};

/// How a record name is derived from an object's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordName {
    /// `config/<short-kind>`; the same name for any object.
    Fixed(String),
    /// `<prefix>/<name>`
    Cluster(String),
    /// `<prefix>/<namespace>/<name>`
    Namespaced(String),
    /// `cluster-scoped-resources/<group>/<resource>/<name>`
    ClusterScopedResource,
    /// `namespaces/<namespace>/<group>/<resource>/<name>`
    NamespacedResource,
}

impl RecordName {
    pub fn fixed(s: &str) -> Self { RecordName::Fixed(s.to_string()) }
    pub fn cluster(prefix: &str) -> Self { RecordName::Cluster(prefix.to_string()) }
    pub fn namespaced(prefix: &str) -> Self { RecordName::Namespaced(prefix.to_string()) }

    pub fn render(&self, gvr: &Gvr, obj: &DynamicObject) -> String {
        let name = obj.name();
        let ns = obj.namespace().unwrap_or_default();
        match self {
            RecordName::Fixed(s) => s.clone(),
            RecordName::Cluster(p) => format!("{p}/{name}"),
            RecordName::Namespaced(p) => format!("{p}/{ns}/{name}"),
            RecordName::ClusterScopedResource => cluster_scoped_resource(gvr, name),
            RecordName::NamespacedResource => namespaced_resource(gvr, ns, name),
        }
    }
}

pub fn cluster_scoped_resource(gvr: &Gvr, name: &str) -> String {
    format!("cluster-scoped-resources/{}/{}/{}", gvr.group, gvr.resource, name)
}

pub fn namespaced_resource(gvr: &Gvr, namespace: &str, name: &str) -> String {
    format!("namespaces/{}/{}/{}/{}", namespace, gvr.group, gvr.resource, name)
}

/// Default name for harvested container logs.
pub fn pod_log(namespace: &str, pod: &str) -> String {
    format!("config/pod/{namespace}/logs/{pod}/errors.log")
}

pub fn pod(namespace: &str, pod: &str) -> String {
    format!("config/pod/{namespace}/{pod}")
}

pub fn aggregated(name: &str) -> String {
    format!("aggregated/{name}")
}
