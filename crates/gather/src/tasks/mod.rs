//! Hand-written tasks: cross-references, counters, filters and scrapes that
//! do not fit the catalog's list/get shape.

use crate::{Registry, TaskEntry, TaskKind};

pub mod config_maps;
pub mod csr;
pub mod image_registry;
pub mod lokistack;
pub mod machine_configs;
pub mod node_logs;
pub mod olm;
pub mod operators;
pub mod overlap;
pub mod pncc;
pub mod policy;
pub mod prometheus;
pub mod sap;
pub mod version;
pub mod workloads;

/// Add every hand-written task to `r`.
pub fn register(r: &mut Registry) {
    let tasks = [
        TaskEntry::new("version", TaskKind::Singleton, version::gather),
        TaskEntry::new("certificate_signing_requests", TaskKind::Custom, csr::gather),
        TaskEntry::new("overlapping_namespace_uids", TaskKind::Custom, overlap::gather),
        TaskEntry::new("machine_configs", TaskKind::CrossReference, machine_configs::gather),
        TaskEntry::new("lokistacks", TaskKind::ListShaped, lokistack::gather),
        TaskEntry::new("operators", TaskKind::CrossReference, operators::gather),
        TaskEntry::new("image_registries", TaskKind::CrossReference, image_registry::gather),
        TaskEntry::new("config_maps", TaskKind::Custom, config_maps::gather),
        TaskEntry::new("container_images", TaskKind::Counter, workloads::container_images),
        TaskEntry::new("service_accounts", TaskKind::Counter, workloads::service_accounts),
        TaskEntry::new("install_plans", TaskKind::Counter, olm::install_plans),
        TaskEntry::new("olm_operators", TaskKind::CrossReference, olm::olm_operators),
        TaskEntry::new("pod_network_connectivity_checks", TaskKind::Counter, pncc::gather),
        TaskEntry::new("pdbs", TaskKind::List, policy::pdbs),
        TaskEntry::new("validating_webhook_configurations", TaskKind::ListShaped, policy::validating_webhooks),
        TaskEntry::new("mutating_webhook_configurations", TaskKind::ListShaped, policy::mutating_webhooks),
        TaskEntry::new("metrics", TaskKind::Scrape, prometheus::metrics),
        TaskEntry::new("active_alerts", TaskKind::Scrape, prometheus::active_alerts),
        TaskEntry::new("silenced_alerts", TaskKind::Scrape, prometheus::silenced_alerts),
        TaskEntry::new("tsdb_status", TaskKind::Scrape, prometheus::tsdb_status),
        TaskEntry::new("dvo_metrics", TaskKind::Scrape, prometheus::dvo_metrics),
        TaskEntry::new("node_logs", TaskKind::LogHarvest, node_logs::gather),
        TaskEntry::new("sap_config", TaskKind::Custom, sap::config).gated(sap::datahubs()),
        TaskEntry::new("sap_pods", TaskKind::Custom, sap::pods).gated(sap::datahubs()),
        TaskEntry::new("sap_datahubs", TaskKind::List, sap::datahub_objects).gated(sap::datahubs()),
        TaskEntry::new("sap_license_management_logs", TaskKind::LogHarvest, sap::license_management_logs).gated(sap::datahubs()),
    ];
    for t in tasks {
        r.register(t);
    }
}
