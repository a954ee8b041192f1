//! Archive-wide obfuscation: the obfuscator is built from cluster config
//! and wraps every record before it leaves the dispatcher.

use std::sync::Arc;

use harvest_anonymize::{ObfuscatingMarshaller, Obfuscator};
use harvest_core::{DynamicObject, Record};
use harvest_kubehub::Clients;
use serde_json::Value;
use tracing::{info, warn};

fn strings(obj: &DynamicObject, path: &[&str], field: Option<&str>) -> Vec<String> {
    let Some(items) = obj.at(path).and_then(Value::as_array) else { return Vec::new() };
    items
        .iter()
        .filter_map(|v| match field {
            Some(f) => v.get(f).and_then(Value::as_str),
            None => v.as_str(),
        })
        .map(str::to_string)
        .collect()
}

/// CIDRs from the cluster network config, in the order addresses are matched.
pub fn networks_of(network: &DynamicObject) -> Vec<String> {
    let mut out = strings(network, &["spec", "clusterNetwork"], Some("cidr"));
    out.extend(strings(network, &["spec", "serviceNetwork"], None));
    out.extend(strings(network, &["spec", "externalIP", "autoAssignCIDRs"], None));
    out.extend(strings(network, &["spec", "externalIP", "policy", "allowedCIDRs"], None));
    out.extend(strings(network, &["spec", "externalIP", "policy", "rejectedCIDRs"], None));
    out
}

/// Reads `dnses/cluster` and `networks/cluster`. Missing or unreadable config
/// leaves that part of the obfuscator empty.
pub async fn load(clients: &Clients) -> Obfuscator {
    let config = clients.config();
    let base_domain = match config.get("dnses", "cluster").await {
        Ok(dns) => dns.and_then(|d| d.str_at(&["spec", "baseDomain"]).map(str::to_string)),
        Err(e) => {
            warn!(error = %e, "obfuscation: cluster dns config unavailable");
            None
        }
    };
    let networks = match config.get("networks", "cluster").await {
        Ok(n) => n.map(|n| networks_of(&n)).unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "obfuscation: cluster network config unavailable");
            Vec::new()
        }
    };
    info!(base_domain = base_domain.is_some(), networks = networks.len(), "obfuscation: ready");
    Obfuscator::new(base_domain.as_deref(), &networks)
}

pub fn apply(records: Vec<Record>, obfuscator: &Arc<Obfuscator>) -> Vec<Record> {
    records
        .into_iter()
        .map(|r| Record {
            name: obfuscator.name(&r.name),
            item: Arc::new(ObfuscatingMarshaller { inner: r.item, obfuscator: obfuscator.clone() }),
            ..r
        })
        .collect()
}
