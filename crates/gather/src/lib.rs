//! Harvest gather: the task catalog.
//!
//! Most tasks are plain data ([`catalog::CatalogEntry`]) run by one
//! interpreter; the rest are hand-written in [`tasks`]. Both end up as
//! [`TaskEntry`] values in a [`Registry`], which is what the dispatcher runs.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use harvest_core::{Gvr, TaskId, TaskOutput};
use harvest_kubehub::{AccessError, Clients, PageBudget};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod catalog;
pub mod shape;
pub mod tasks;

pub use catalog::{CatalogEntry, Emit, Limit, LimitStyle, ListSpec, LogSpec, Naming, SingletonSpec, Spec};
pub use shape::Shape;

/// Group prefix of every built-in task identifier.
pub const GROUP: &str = "clusterconfig";

/// Run-wide knobs tasks may read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatherSettings {
    pub archive_max_bytes: usize,
    pub log_compression_ratio: usize,
    pub node_log_tail_lines: u32,
}

impl Default for GatherSettings {
    fn default() -> Self { Self { archive_max_bytes: 8 * 1024 * 1024, log_compression_ratio: 2, node_log_tail_lines: 400 } }
}

/// What a task receives: its scoped client handles and the run settings.
#[derive(Clone)]
pub struct TaskContext {
    pub clients: Clients,
    pub settings: Arc<GatherSettings>,
}

impl TaskContext {
    pub fn new(clients: Clients, settings: Arc<GatherSettings>) -> Self { Self { clients, settings } }

    /// Page size of the run budget with a task-specific item cap.
    pub fn budget(&self, max_items: usize) -> PageBudget { PageBudget::new(self.clients.budget().page_limit, max_items) }
}

/// A task as the dispatcher sees it.
pub type GatherFn = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, TaskOutput> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Singleton,
    List,
    ListShaped,
    Conditional,
    Counter,
    CrossReference,
    LogHarvest,
    Scrape,
    Custom,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Singleton => "singleton",
            TaskKind::List => "list",
            TaskKind::ListShaped => "list_shaped",
            TaskKind::Conditional => "conditional",
            TaskKind::Counter => "counter",
            TaskKind::CrossReference => "cross_reference",
            TaskKind::LogHarvest => "log_harvest",
            TaskKind::Scrape => "scrape",
            TaskKind::Custom => "custom",
        }
    }
}

#[derive(Clone)]
pub struct TaskEntry {
    pub id: TaskId,
    pub kind: TaskKind,
    pub run: GatherFn,
}

impl TaskEntry {
    pub fn new<F, Fut>(name: &str, kind: TaskKind, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        Self { id: TaskId::new(GROUP, name), kind, run: Arc::new(move |ctx| f(ctx).boxed()) }
    }

    /// Only run when at least one `marker` object exists.
    pub fn gated(mut self, marker: Gvr) -> Self {
        let inner = self.run.clone();
        let marker = Arc::new(marker);
        self.kind = TaskKind::Conditional;
        self.run = Arc::new(move |ctx: TaskContext| {
            let inner = inner.clone();
            let marker = marker.clone();
            async move {
                match ctx.clients.dynamic().has_any(&marker).await {
                    Ok(true) => inner(ctx).await,
                    Ok(false) => {
                        debug!(marker = %marker, "gather: marker absent, skipping");
                        TaskOutput::not_installed()
                    }
                    Err(e) => access_failure(&format!("checking for {marker}"), e),
                }
            }
            .boxed()
        });
        self
    }
}

impl std::fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEntry").field("id", &self.id).field("kind", &self.kind).finish()
    }
}

/// The task catalog, keyed by identifier.
#[derive(Clone, Default)]
pub struct Registry {
    entries: BTreeMap<TaskId, TaskEntry>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Every built-in task.
    pub fn builtin() -> Self {
        let mut r = Self::new();
        for entry in catalog::builtin() {
            r.register(entry.into_task());
        }
        tasks::register(&mut r);
        r
    }

    /// Returns the entry previously registered under the same id.
    pub fn register(&mut self, entry: TaskEntry) -> Option<TaskEntry> { self.entries.insert(entry.id.clone(), entry) }

    pub fn get(&self, id: &TaskId) -> Option<&TaskEntry> { self.entries.get(id) }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn ids(&self) -> impl Iterator<Item = &TaskId> { self.entries.keys() }
    pub fn entries(&self) -> impl Iterator<Item = &TaskEntry> { self.entries.values() }

    /// `group/task` → closure.
    pub fn functions(&self) -> BTreeMap<String, GatherFn> {
        self.entries.iter().map(|(id, e)| (id.to_string(), e.run.clone())).collect()
    }
}

/// Shared mapping of a failed call: absent kinds are silent, cancellation is
/// a warning, anything else is fatal for the task.
pub fn access_failure(what: &str, e: AccessError) -> TaskOutput {
    match e {
        AccessError::NotFound(_) => TaskOutput::not_installed(),
        AccessError::Cancelled => {
            let mut out = TaskOutput::new();
            out.warn(format!("{what}: cancelled"));
            out
        }
        other => TaskOutput::fatal(format!("{what}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_kubehub::MockCluster;
    use serde_json::json;

    fn ctx(m: MockCluster) -> TaskContext { TaskContext::new(Clients::new(Arc::new(m)), Arc::new(GatherSettings::default())) }

    #[test]
    fn builtin_ids_are_unique_and_grouped() {
        let r = Registry::builtin();
        assert!(r.len() >= 60, "catalog has {} tasks", r.len());
        assert!(r.ids().all(|id| id.group == GROUP));
        let fns = r.functions();
        assert_eq!(fns.len(), r.len());
        assert!(fns.contains_key("clusterconfig/lokistacks"));
        assert!(fns.contains_key("clusterconfig/kube_controller_manager_logs"));
    }

    #[test]
    fn register_replaces_and_returns_previous() {
        let mut r = Registry::new();
        assert!(r.register(TaskEntry::new("x", TaskKind::Custom, |_| async { TaskOutput::new() })).is_none());
        let prev = r.register(TaskEntry::new("x", TaskKind::Counter, |_| async { TaskOutput::new() }));
        assert_eq!(prev.map(|e| e.kind), Some(TaskKind::Custom));
        assert_eq!(r.len(), 1);
    }

    #[tokio::test]
    async fn gated_task_is_silent_without_marker() {
        let marker = Gvr::new("installers.datahub.sap.com", "v1alpha1", "datahubs");
        let entry = TaskEntry::new("datahubs", TaskKind::Custom, |_| async {
            let mut out = TaskOutput::new();
            out.warn("ran");
            out
        })
        .gated(marker.clone());
        assert_eq!(entry.kind, TaskKind::Conditional);
        assert!((entry.run)(ctx(MockCluster::new())).await.is_empty());
        let present = MockCluster::new().with(&marker, vec![json!({"metadata": {"name": "dh", "namespace": "sdi"}})]);
        assert_eq!((entry.run)(ctx(present)).await.warnings().collect::<Vec<_>>(), vec!["ran"]);
    }

    #[test]
    fn failures_map_by_kind() {
        assert!(access_failure("x", AccessError::NotFound("v1/pods".into())).is_empty());
        assert!(access_failure("x", AccessError::Cancelled).status().is_warning());
        let out = access_failure("listing pods", AccessError::Transport("reset".into()));
        assert!(out.status().is_fatal());
    }
}
