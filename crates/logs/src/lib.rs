//! Harvest logs: container log harvesting.
//!
//! Pods are listed by namespace and selectors; every container whose name
//! matches the container regex has its log streamed, scanned line by line,
//! and reduced to the lines matching the message filter. One record is
//! emitted per container with retained text.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use harvest_core::{names, RawBytes, Record, TaskOutput};
use harvest_kubehub::{AccessError, Clients, ListQuery, LogQuery, Profile};
use k8s_openapi::api::core::v1::Pod;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod gzip;
pub mod pump;

pub use pump::{scan_stream, LineMatcher, Retained};

/// Default look-back window for harvested logs.
pub const DEFAULT_SINCE_SECONDS: i64 = 86_400;
/// Default per-container byte cap.
pub const DEFAULT_LIMIT_BYTES: i64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("cancelled")]
    Cancelled,
    #[error("stream: {0}")]
    Stream(String),
    #[error("gzip: {0}")]
    Gzip(String),
    #[error("body exceeds {0} bytes")]
    TooLarge(usize),
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Which containers to read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerFilter {
    /// `None` lists pods in every namespace.
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Missing regex selects every container.
    pub container_regex: Option<String>,
    /// 0 means no cap.
    pub max_namespace_containers: usize,
}

impl ContainerFilter {
    pub fn namespace(ns: &str) -> Self { Self { namespace: Some(ns.to_string()), ..Default::default() } }

    pub fn labels(mut self, sel: &str) -> Self {
        self.label_selector = Some(sel.to_string());
        self
    }

    pub fn containers(mut self, re: &str) -> Self {
        self.container_regex = Some(re.to_string());
        self
    }
}

/// Which lines to keep and how much log to request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageFilter {
    /// Empty keeps every line.
    pub patterns: Vec<String>,
    pub is_regex: bool,
    pub since_seconds: i64,
    /// 0 means no cap.
    pub limit_bytes: i64,
    pub tail_lines: i64,
    pub previous: bool,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            is_regex: false,
            since_seconds: DEFAULT_SINCE_SECONDS,
            limit_bytes: DEFAULT_LIMIT_BYTES,
            tail_lines: 0,
            previous: false,
        }
    }
}

impl MessageFilter {
    pub fn substrings(patterns: &[&str]) -> Self {
        Self { patterns: patterns.iter().map(|p| p.to_string()).collect(), ..Default::default() }
    }

    pub fn regex(patterns: &[&str]) -> Self { Self { is_regex: true, ..Self::substrings(patterns) } }

    pub fn limit_bytes(mut self, n: i64) -> Self {
        self.limit_bytes = n;
        self
    }

    pub fn since_seconds(mut self, n: i64) -> Self {
        self.since_seconds = n;
        self
    }

    /// Zero-valued limits are left out of the request.
    pub fn log_query(&self, container: &str) -> LogQuery {
        let positive = |n: i64| (n > 0).then_some(n);
        LogQuery {
            container: Some(container.to_string()),
            since_seconds: positive(self.since_seconds),
            limit_bytes: positive(self.limit_bytes),
            tail_lines: positive(self.tail_lines),
            previous: self.previous,
            timestamps: true,
        }
    }

    pub fn cap(&self) -> Option<usize> { usize::try_from(self.limit_bytes).ok().filter(|n| *n > 0) }
}

/// Record name for `(namespace, pod, container)`.
pub type NameBuilder = Arc<dyn Fn(&str, &str, &str) -> String + Send + Sync>;

pub fn default_name_builder() -> NameBuilder { Arc::new(|ns, pod, _container| names::pod_log(ns, pod)) }

fn container_names(pod: &Pod) -> Vec<String> {
    let Some(spec) = &pod.spec else { return Vec::new() };
    let regular = spec.containers.iter().map(|c| c.name.clone());
    let init = spec.init_containers.iter().flatten().map(|c| c.name.clone());
    regular.chain(init).collect()
}

/// Read and filter one container's log.
pub async fn read_container(
    clients: &Clients,
    namespace: &str,
    pod: &str,
    query: &LogQuery,
    matcher: &LineMatcher,
    cap: Option<usize>,
) -> Result<Retained, LogError> {
    let stream = clients.pod_logs(namespace, pod, query).await.map_err(|e| match e {
        AccessError::Cancelled => LogError::Cancelled,
        other => LogError::Access(other),
    })?;
    scan_stream(stream, matcher, cap, clients.cancel_token()).await
}

/// Collect matching log lines from every selected container.
///
/// Records are named by `names` (default `config/pod/<ns>/logs/<pod>/errors.log`);
/// containers mapping to the same name share one record, in container order.
pub async fn collect_logs_from_containers(
    clients: &Clients,
    filter: &ContainerFilter,
    messages: &MessageFilter,
    names: Option<&NameBuilder>,
) -> TaskOutput {
    let started = Instant::now();
    let ns_label = filter.namespace.as_deref().unwrap_or("*").to_string();
    let matcher = match LineMatcher::new(&messages.patterns, messages.is_regex) {
        Ok(m) => m,
        Err(e) => return TaskOutput::fatal(format!("invalid message pattern: {e}")),
    };
    let container_re = match filter.container_regex.as_deref().map(Regex::new).transpose() {
        Ok(re) => re,
        Err(e) => return TaskOutput::fatal(format!("invalid container regex: {e}")),
    };
    let default_names = default_name_builder();
    let names = names.unwrap_or(&default_names);

    let query = ListQuery {
        label_selector: filter.label_selector.clone(),
        field_selector: filter.field_selector.clone(),
        ..Default::default()
    };
    let pods = match clients.workload(Profile::Proto).list::<Pod>(filter.namespace.as_deref(), &query).await {
        Ok(p) => p,
        Err(AccessError::NotFound(_)) => return TaskOutput::not_installed(),
        Err(e) => return TaskOutput::fatal(format!("listing pods in namespace {ns_label}: {e}")),
    };
    let mut out = TaskOutput::new();
    for w in pods.warnings() {
        out.warn(w);
    }
    if pods.items.is_empty() {
        info!(ns = %ns_label, "logs: no pods found");
    }

    let cap = messages.cap();
    let mut merged: Vec<(String, String)> = Vec::new();
    let mut read = 0usize;
    let mut skipped = 0usize;
    for pod in &pods.items {
        let (Some(pod_ns), Some(pod_name)) = (pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref()) else {
            continue;
        };
        let selected: Vec<String> = container_names(pod)
            .into_iter()
            .filter(|c| container_re.as_ref().map_or(true, |re| re.is_match(c)))
            .collect();
        for container in selected {
            if filter.max_namespace_containers > 0 && read >= filter.max_namespace_containers {
                skipped += 1;
                continue;
            }
            read += 1;
            let q = messages.log_query(&container);
            match read_container(clients, pod_ns, pod_name, &q, &matcher, cap).await {
                Ok(kept) if kept.is_blank() => {}
                Ok(kept) => {
                    let name = names(pod_ns, pod_name, &container);
                    match merged.iter_mut().find(|(n, _)| *n == name) {
                        Some((_, text)) => {
                            text.push('\n');
                            text.push_str(&kept.text());
                        }
                        None => merged.push((name, kept.text())),
                    }
                }
                Err(LogError::Cancelled) => {
                    out.warn(format!("log harvest in namespace {ns_label} cancelled"));
                    return out;
                }
                Err(e) => {
                    warn!(ns = %pod_ns, pod = %pod_name, container = %container, error = %e, "logs: container read failed");
                    out.warn(format!("failed to read logs of container {pod_ns}/{pod_name}/{container}: {e}"));
                }
            }
        }
    }
    for (name, text) in merged {
        out.push(Record::new(name, RawBytes::text(text)));
    }
    if skipped > 0 {
        out.warn(format!(
            "skipping {skipped} containers on namespace {ns_label} (max: {})",
            filter.max_namespace_containers
        ));
    }
    debug!(ns = %ns_label, records = out.records.len(), took_ms = %started.elapsed().as_millis(), "logs: harvest done");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limits_are_omitted() {
        let f = MessageFilter { since_seconds: 0, limit_bytes: 0, ..MessageFilter::substrings(&["x"]) };
        let q = f.log_query("c");
        assert_eq!(q.since_seconds, None);
        assert_eq!(q.limit_bytes, None);
        assert!(q.timestamps);
        assert_eq!(f.cap(), None);
        assert_eq!(MessageFilter::default().cap(), Some(64 * 1024));
    }

    #[test]
    fn init_containers_are_included() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "p"},
            "spec": {"containers": [{"name": "main"}], "initContainers": [{"name": "setup"}]}
        }))
        .expect("pod");
        assert_eq!(container_names(&pod), vec!["main", "setup"]);
    }
}
