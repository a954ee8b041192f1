//! Kubelet errors from the journal of control-plane nodes.

use harvest_core::{RawBytes, Record, TaskOutput};
use harvest_kubehub::{ListQuery, Profile};
use harvest_logs::gzip::maybe_gunzip;
use k8s_openapi::api::core::v1::Node;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::{access_failure, TaskContext};

const MASTER_SELECTOR: &str = "node-role.kubernetes.io/master";
const UNIT: &str = "kubelet";

static KLOG_ERROR: Lazy<Regex> = Lazy::new(|| Regex::new(r"E\d{4} \d{1,2}:\d{1,2}:\d{1,2}").expect("static klog pattern"));

/// Bytes each node may use: half of its share of the uncompressed archive.
pub fn buffer_per_node(archive_max: usize, ratio: usize, nodes: usize) -> usize {
    archive_max.saturating_mul(ratio) / nodes.max(1) / 2
}

/// The last `tail` kubelet error lines of a journal excerpt.
pub fn error_lines(text: &str, tail: usize) -> String {
    let matched: Vec<&str> = text.lines().filter(|l| KLOG_ERROR.is_match(l)).collect();
    let from = matched.len().saturating_sub(tail);
    matched[from..].join("\n")
}

pub async fn gather(ctx: TaskContext) -> TaskOutput {
    let nodes = match ctx.clients.workload(Profile::Proto).list::<Node>(None, &ListQuery::labels(MASTER_SELECTOR)).await {
        Ok(p) => p,
        Err(e) => return access_failure("listing master nodes", e),
    };
    let names: Vec<String> = nodes.items.iter().filter_map(|n| n.metadata.name.clone()).collect();
    let buffer = buffer_per_node(ctx.settings.archive_max_bytes, ctx.settings.log_compression_ratio, names.len());
    let tail = ctx.settings.node_log_tail_lines as usize;
    let rest = ctx.clients.rest(Profile::Standard);
    let mut out = TaskOutput::new();
    for node in &names {
        let req = rest
            .request(&format!("/api/v1/nodes/{node}/proxy/logs/journal"))
            .param("tail", &tail.to_string())
            .param("unit", UNIT)
            .accept("text/plain, */*")
            .gzip();
        let body = match rest.get_bytes(&req, buffer).await {
            Ok((b, cut)) => {
                if cut {
                    debug!(node = %node, buffer, "node_logs: journal cut at buffer size");
                }
                b
            }
            Err(e) => {
                warn!(node = %node, error = %e, "node_logs: journal unavailable");
                out.fail(format!("node {node}: {e}"));
                continue;
            }
        };
        let text = match maybe_gunzip(&body, buffer) {
            Ok((plain, partial)) => {
                if partial {
                    debug!(node = %node, decoded = plain.len(), "node_logs: keeping the decoded part of the journal");
                }
                String::from_utf8_lossy(&plain).into_owned()
            }
            Err(e) => {
                out.fail(format!("node {node}: decompressing journal: {e}"));
                continue;
            }
        };
        out.push(Record::new(format!("config/node/logs/{node}.log"), RawBytes::text(error_lines(&text, tail))));
    }
    for w in nodes.warnings() {
        out.warn(w);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatherSettings;
    use flate2::{write::GzEncoder, Compression};
    use harvest_kubehub::{gvr_of, Clients, MockCluster};
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).expect("write");
        enc.finish().expect("finish")
    }

    #[test]
    fn buffer_is_split_across_nodes() {
        assert_eq!(buffer_per_node(8 * 1024 * 1024, 2, 4), 2 * 1024 * 1024);
        assert_eq!(buffer_per_node(100, 2, 0), 100);
    }

    #[test]
    fn only_klog_errors_survive_and_tail_applies() {
        let text = "I0301 10:00:00 ok\nE0301 10:00:01 first\nW0301 10:00:02 warn\nE0301 10:00:03 second\nE0301 10:00:04 third\n";
        assert_eq!(error_lines(text, 2), "E0301 10:00:03 second\nE0301 10:00:04 third");
        assert_eq!(error_lines("nothing here", 5), "");
    }

    #[tokio::test]
    async fn master_journals_are_fetched_and_unzipped() {
        let node = |name: &str, master: bool| {
            let labels = if master { json!({MASTER_SELECTOR: ""}) } else { json!({"node-role.kubernetes.io/worker": ""}) };
            json!({"metadata": {"name": name, "labels": labels}})
        };
        let journal = gz(b"Mar 01 kubelet[1]: E0301 10:00:01.000 failed to sync pod\nMar 01 kubelet[1]: I0301 fine\n");
        let m = MockCluster::new()
            .with(&gvr_of::<Node>(), vec![node("master-0", true), node("worker-0", false), node("master-1", true)])
            .with_raw(Profile::Standard, "/api/v1/nodes/master-0/proxy/logs/journal", journal);
        let settings = GatherSettings { node_log_tail_lines: 10, ..GatherSettings::default() };
        let ctx = TaskContext::new(Clients::new(Arc::new(m.clone())), Arc::new(settings));
        let out = gather(ctx).await;
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].path(), "config/node/logs/master-0.log");
        assert_eq!(out.records[0].marshal().expect("log"), b"Mar 01 kubelet[1]: E0301 10:00:01.000 failed to sync pod");
        assert_eq!(out.errors().count(), 1);
        assert!(m.calls().iter().any(|c| c.ends_with("proxy/logs/journal?tail=10&unit=kubelet")));
    }

    #[tokio::test]
    async fn journal_cut_at_the_buffer_keeps_its_decoded_lines() {
        let journal: String = (0..3000u64)
            .map(|i| format!("Mar 01 kubelet[1]: E0301 10:{:02}:{:02}.{:06} sync pod {:x}\n", i % 60, i * 7 % 60, i * 7919 % 999_983, i.wrapping_mul(0x9e37_79b9_7f4a_7c15)))
            .collect();
        let z = gz(journal.as_bytes());
        let node = json!({"metadata": {"name": "master-0", "labels": {MASTER_SELECTOR: ""}}});
        let m = MockCluster::new()
            .with(&gvr_of::<Node>(), vec![node])
            .with_raw(Profile::Standard, "/api/v1/nodes/master-0/proxy/logs/journal", z.clone());
        let settings = GatherSettings { archive_max_bytes: 4096, log_compression_ratio: 2, node_log_tail_lines: 5000 };
        assert!(z.len() > buffer_per_node(4096, 2, 1));
        let ctx = TaskContext::new(Clients::new(Arc::new(m)), Arc::new(settings));
        let out = gather(ctx).await;
        assert_eq!(out.errors().count(), 0);
        assert_eq!(out.records.len(), 1);
        let kept = out.records[0].marshal().expect("log");
        assert!(!kept.is_empty());
        assert!(journal.as_bytes().starts_with(&kept));
    }
}
