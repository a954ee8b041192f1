//! Cluster operators and the operator resources they point at.

use std::collections::HashMap;

use harvest_core::{DynamicObject, Gvr, JsonMarshaller, Record, ResourceMarshaller, TaskOutput};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{access_failure, TaskContext};

const OPERATOR_GROUP_MARKER: &str = "operator.openshift.io";
const SENSITIVE_PROVIDER_FIELDS: [&str; 7] = ["url", "bindDN", "hostname", "clientID", "hostedDomain", "issuer", "domainName"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedResource {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub spec: Value,
    #[serde(skip)]
    pub namespace: String,
}

impl RelatedResource {
    pub fn record_name(&self) -> String {
        let group = self.api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or_default();
        let kind = self.kind.to_lowercase();
        if self.namespace.is_empty() {
            format!("config/clusteroperator/{group}/{kind}/{}", self.name)
        } else {
            format!("config/clusteroperator/{group}/{kind}/{}/{}", self.namespace, self.name)
        }
    }
}

/// Masks identity-provider details in an operator's observed config.
pub fn anonymize_identity_providers(obj: &mut DynamicObject) {
    let providers = obj.value_mut().pointer_mut("/spec/observedConfig/oauthServer/oauthConfig/identityProviders").and_then(Value::as_array_mut);
    let Some(providers) = providers else { return };
    for p in providers.iter_mut() {
        let Some(provider) = p.get_mut("provider").and_then(Value::as_object_mut) else { continue };
        for field in SENSITIVE_PROVIDER_FIELDS {
            if let Some(Value::String(s)) = provider.get_mut(field) {
                *s = harvest_anonymize::string(s);
            }
        }
    }
}

async fn related(ctx: &TaskContext, co: &DynamicObject, versions: &HashMap<String, String>) -> Vec<RelatedResource> {
    let refs = co.at(&["status", "relatedObjects"]).and_then(Value::as_array).cloned().unwrap_or_default();
    let mut out = Vec::new();
    for r in refs {
        let text = |k: &str| r.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
        let group = text("group");
        if !group.contains(OPERATOR_GROUP_MARKER) {
            continue;
        }
        let Some(version) = versions.get(&group) else {
            debug!(group = %group, "operators: group not served");
            continue;
        };
        let mut name = text("name");
        if name.is_empty() && co.name() == "ingress" {
            name = "default".into();
        }
        let namespace = text("namespace");
        let gvr = Gvr::new(&group, version, &text("resource"));
        let ns = Some(namespace.as_str()).filter(|s| !s.is_empty());
        let mut obj = match ctx.clients.dynamic().get(&gvr, ns, &name).await {
            Ok(Some(o)) => o,
            Ok(None) => continue,
            Err(e) => {
                debug!(gvr = %gvr, name = %name, error = %e, "operators: related object unavailable");
                continue;
            }
        };
        anonymize_identity_providers(&mut obj);
        let spec = obj.at(&["spec"]).cloned().unwrap_or_else(|| {
            warn!(name = obj.name(), "operators: related object has no spec");
            Value::Null
        });
        out.push(RelatedResource {
            api_version: obj.api_version().map(str::to_string).unwrap_or_else(|| gvr.api_version()),
            kind: obj.kind().unwrap_or_default().to_string(),
            name: obj.name().to_string(),
            spec,
            namespace: obj.namespace().unwrap_or_default().to_string(),
        });
    }
    out
}

pub async fn gather(ctx: TaskContext) -> TaskOutput {
    let operators = match ctx.clients.config().list("clusteroperators").await {
        Ok(p) => p,
        Err(e) => return access_failure("listing clusteroperators", e),
    };
    let versions: Option<HashMap<String, String>> = match ctx.clients.api_groups().await {
        Ok(groups) => Some(
            groups
                .into_iter()
                .filter(|g| g.name.contains(OPERATOR_GROUP_MARKER))
                .filter_map(|g| g.versions.first().cloned().map(|v| (g.name, v)))
                .collect(),
        ),
        Err(e) => {
            warn!(error = %e, "operators: can't read operator resource versions");
            None
        }
    };
    let mut out = TaskOutput::new();
    for co in &operators.items {
        out.push(Record::new(format!("config/clusteroperator/{}", co.name()), ResourceMarshaller(co.value().clone())));
        let Some(versions) = versions.as_ref() else { continue };
        for rr in related(&ctx, co, versions).await {
            if rr.api_version.contains("imageregistry") {
                continue;
            }
            out.push(Record::new(rr.record_name(), JsonMarshaller(rr)));
        }
    }
    for w in operators.warnings() {
        out.warn(w);
    }
    out
}
