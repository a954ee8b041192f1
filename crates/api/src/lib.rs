//! Harvest public API façade (in-process).
//!
//! Frontends depend on [`HarvestApi`] only: list the catalog, run a gather
//! into an [`ArchiveSink`], read back the last run summary. [`InProcApi`]
//! drives the dispatcher directly; [`MockApi`] returns canned answers.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use harvest_dispatch::{Dispatcher, TaskReport};
use harvest_gather::Registry;
use harvest_kubehub::{ClusterAccess, Clients, KubeCluster};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub mod archive;
pub mod config;

pub use archive::{ArchiveSink, ArchiveStats, DirArchive, MemoryArchive, StoredFile};
pub use config::{GatherConfig, ObfuscationConfig};

/// One catalog entry as frontends see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskInfo {
    /// `group/task`
    pub id: String,
    pub kind: String,
}

/// What a finished gather reports back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub took_ms: u64,
    pub tasks: usize,
    pub failed_tasks: Vec<String>,
    pub disabled: Vec<String>,
    /// Run faults plus records that could not be marshalled.
    pub errors: Vec<String>,
    pub archive: ArchiveStats,
    pub reports: Vec<TaskReport>,
}

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum HarvestError {
    #[error("config: {0}")]
    Config(String),
    #[error("cluster: {0}")]
    Cluster(String),
    #[error("archive: {0}")]
    Archive(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type HarvestResult<T> = Result<T, HarvestError>;

#[async_trait::async_trait]
pub trait HarvestApi: Send + Sync {
    /// Every task id the engine knows, with its kind.
    async fn catalog(&self) -> HarvestResult<Vec<TaskInfo>>;

    /// Run the enabled tasks once and hand every record to `sink`.
    /// `only` narrows the run when non-empty.
    async fn gather(&self, config: &GatherConfig, only: &[String], sink: &mut dyn ArchiveSink) -> HarvestResult<RunSummary>;

    /// Summary of the last finished gather, if any.
    async fn summary(&self) -> HarvestResult<Option<RunSummary>>;
}

// ----------------- In-process implementation -----------------

/// Runs the dispatcher in this process. Without an injected cluster it
/// connects with the ambient kubeconfig on every gather.
#[derive(Default)]
pub struct InProcApi {
    access: Option<Arc<dyn ClusterAccess>>,
    last: Mutex<Option<RunSummary>>,
}

impl InProcApi {
    pub fn new() -> Self { Self::default() }

    pub fn with_access(access: Arc<dyn ClusterAccess>) -> Self { Self { access: Some(access), last: Mutex::new(None) } }

    async fn access(&self, config: &GatherConfig) -> HarvestResult<Arc<dyn ClusterAccess>> {
        if let Some(a) = &self.access {
            return Ok(a.clone());
        }
        let cluster = KubeCluster::try_default(config.endpoints.clone()).await.map_err(|e| HarvestError::Cluster(format!("{e:#}")))?;
        Ok(Arc::new(cluster))
    }

    fn remember(&self, summary: &RunSummary) -> HarvestResult<()> {
        let mut last = self.last.lock().map_err(|e| HarvestError::Internal(e.to_string()))?;
        *last = Some(summary.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl HarvestApi for InProcApi {
    async fn catalog(&self) -> HarvestResult<Vec<TaskInfo>> {
        let registry = Registry::builtin();
        let tasks: Vec<TaskInfo> =
            registry.entries().map(|e| TaskInfo { id: e.id.to_string(), kind: e.kind.as_str().to_string() }).collect();
        info!(count = tasks.len(), "api: catalog ok");
        Ok(tasks)
    }

    async fn gather(&self, config: &GatherConfig, only: &[String], sink: &mut dyn ArchiveSink) -> HarvestResult<RunSummary> {
        let t0 = Instant::now();
        let started_at = Utc::now();
        info!(only = only.len(), disabled = config.disabled.len(), "api: gather start");
        let clients = Clients::new(self.access(config).await?).with_limiter(Arc::new(config.limiter())).with_budget(config.budget());
        let dispatcher = Dispatcher::new(Registry::builtin(), clients, config.gather_settings(), config.dispatch_options(only));
        let result = dispatcher.run().await;

        let mut errors = result.metadata.errors.clone();
        for record in &result.records {
            match record.marshal() {
                Ok(bytes) => sink.accept(record, bytes)?,
                Err(e) => {
                    warn!(record = %record.name, error = %format!("{e:#}"), "api: record skipped");
                    errors.push(format!("{e:#}"));
                }
            }
        }
        let archive = sink.finish()?;
        let reports = result.metadata.status_reports;
        let summary = RunSummary {
            started_at,
            took_ms: t0.elapsed().as_millis() as u64,
            tasks: reports.len(),
            failed_tasks: reports.iter().filter(|r| !r.errors.is_empty() || r.timed_out).map(|r| r.name.clone()).collect(),
            disabled: result.metadata.disabled,
            errors,
            archive,
            reports,
        };
        self.remember(&summary)?;
        info!(
            tasks = summary.tasks,
            failed = summary.failed_tasks.len(),
            files = summary.archive.written,
            took_ms = summary.took_ms,
            "api: gather ok"
        );
        Ok(summary)
    }

    async fn summary(&self) -> HarvestResult<Option<RunSummary>> {
        let last = self.last.lock().map_err(|e| HarvestError::Internal(e.to_string()))?;
        Ok(last.clone())
    }
}

// ----------------- Mock implementation -----------------

/// Simple in-memory mock implementation for frontend tests.
#[derive(Debug, Default)]
pub struct MockApi {
    pub tasks: Vec<TaskInfo>,
    pub summary: Option<RunSummary>,
}

impl MockApi {
    pub fn new() -> Self { Self::default() }
}

#[async_trait::async_trait]
impl HarvestApi for MockApi {
    async fn catalog(&self) -> HarvestResult<Vec<TaskInfo>> { Ok(self.tasks.clone()) }

    async fn gather(&self, _config: &GatherConfig, _only: &[String], sink: &mut dyn ArchiveSink) -> HarvestResult<RunSummary> {
        let archive = sink.finish()?;
        let mut summary = self.summary.clone().ok_or_else(|| HarvestError::Internal("no summary configured".into()))?;
        summary.archive = archive;
        Ok(summary)
    }

    async fn summary(&self) -> HarvestResult<Option<RunSummary>> { Ok(self.summary.clone()) }
}
