//! Harvest dispatch: runs registry tasks and aggregates their output.
//!
//! Every task runs in its own tokio task on a bounded pool, under a per-task
//! deadline and the run deadline. Panics, failures and timeouts end up in
//! that task's [`TaskReport`]; sibling tasks are unaffected and their records
//! always reach the result.

#![forbid(unsafe_code)]

use std::any::Any;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use harvest_core::{Record, TaskId, TaskOutput};
use harvest_gather::{GatherFn, GatherSettings, Registry, TaskContext};
use harvest_kubehub::Clients;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod obfuscation;
pub mod report;
pub mod selection;

pub use report::{RunMetadata, TaskReport, METADATA_RECORD};
pub use selection::{Selection, ALL};

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub task_timeout: Duration,
    pub run_timeout: Duration,
    /// Zero means [`default_workers`].
    pub workers: usize,
    pub selection: Selection,
    pub obfuscate_networking: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(300),
            run_timeout: Duration::from_secs(900),
            workers: 0,
            selection: Selection::default(),
            obfuscate_networking: false,
        }
    }
}

/// Four workers per available CPU.
pub fn default_workers() -> usize { std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) * 4 }

/// Everything one run produced. `records` ends with the metadata record.
#[derive(Debug)]
pub struct RunResult {
    pub records: Vec<Record>,
    pub metadata: RunMetadata,
}

impl RunResult {
    pub fn reports(&self) -> &[TaskReport] { &self.metadata.status_reports }
    pub fn errors(&self) -> &[String] { &self.metadata.errors }
}

struct TaskRun {
    report: TaskReport,
    records: Vec<Record>,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    clients: Clients,
    settings: Arc<GatherSettings>,
    options: DispatchOptions,
    started: Instant,
}

impl Dispatcher {
    pub fn new(registry: Registry, clients: Clients, settings: GatherSettings, options: DispatchOptions) -> Self {
        Self { registry: Arc::new(registry), clients, settings: Arc::new(settings), options, started: Instant::now() }
    }

    pub fn options(&self) -> &DispatchOptions { &self.options }
    pub fn registry(&self) -> &Registry { &self.registry }

    fn pool_size(&self, tasks: usize) -> usize {
        let wanted = if self.options.workers == 0 { default_workers() } else { self.options.workers };
        wanted.min(tasks).max(1)
    }

    pub async fn run(&self) -> RunResult {
        let t0 = Instant::now();
        let mut enabled = Vec::new();
        let mut disabled = Vec::new();
        for (key, f) in self.registry.functions() {
            match TaskId::parse(&key) {
                Some(id) if self.options.selection.is_enabled(&id) => enabled.push((key, f)),
                _ => disabled.push(key),
            }
        }
        let workers = self.pool_size(enabled.len());
        info!(tasks = enabled.len(), disabled = disabled.len(), workers, "gather: run start");

        let run_cancel = CancellationToken::new();
        let timer = {
            let cancel = run_cancel.clone();
            let limit = self.options.run_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                cancel.cancel();
            })
        };
        let pending: Vec<futures::future::BoxFuture<'_, TaskRun>> =
            enabled.into_iter().map(|(id, f)| Box::pin(self.run_task(id, f, run_cancel.clone())) as _).collect();
        let mut finished: Vec<TaskRun> = futures::stream::iter(pending)
            .buffer_unordered(workers)
            .collect()
            .await;
        timer.abort();
        finished.sort_by(|a, b| a.report.name.cmp(&b.report.name));

        let (mut records, reports, errors) = aggregate(finished);
        for e in &errors {
            error!(error = %e, "gather: run fault");
        }
        if self.options.obfuscate_networking {
            let obfuscator = Arc::new(obfuscation::load(&self.clients).await);
            records = obfuscation::apply(records, &obfuscator);
        }
        counter!("harvest_records_total", records.len() as u64);
        let metadata = RunMetadata {
            status_reports: reports,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            is_global_obfuscation_enabled: self.options.obfuscate_networking,
            disabled,
            errors,
        };
        records.push(metadata.record());
        info!(records = records.len(), took_ms = %t0.elapsed().as_millis(), "gather: run done");
        RunResult { records, metadata }
    }

    async fn run_task(&self, id: String, f: GatherFn, run_cancel: CancellationToken) -> TaskRun {
        let t0 = Instant::now();
        if run_cancel.is_cancelled() {
            let mut out = TaskOutput::new();
            out.warn("run deadline exceeded before the task started");
            let mut report = TaskReport::new(&id, &out, Duration::ZERO);
            report.timed_out = true;
            return finish(report, Vec::new());
        }
        let cancel = run_cancel.child_token();
        let ctx = TaskContext::new(self.clients.scoped(cancel.clone()), self.settings.clone());
        let mut handle = tokio::spawn(f(ctx));
        let joined = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = tokio::time::sleep(self.options.task_timeout) => None,
            _ = run_cancel.cancelled() => None,
        };
        let took = t0.elapsed();
        match joined {
            Some(Ok(out)) => {
                let report = TaskReport::new(&id, &out, took);
                finish(report, out.records)
            }
            Some(Err(e)) if e.is_panic() => {
                let msg = panic_message(e.into_panic());
                let mut report = TaskReport::new(&id, &TaskOutput::fatal(format!("panic: {msg}")), took);
                report.panic = Some(msg);
                finish(report, Vec::new())
            }
            Some(Err(e)) => finish(TaskReport::new(&id, &TaskOutput::fatal(format!("task aborted: {e}")), took), Vec::new()),
            None => {
                cancel.cancel();
                handle.abort();
                let msg = if run_cancel.is_cancelled() {
                    format!("run deadline of {}s exceeded", self.options.run_timeout.as_secs())
                } else {
                    format!("task deadline of {}s exceeded", self.options.task_timeout.as_secs())
                };
                let mut out = TaskOutput::new();
                out.warn(msg);
                let mut report = TaskReport::new(&id, &out, took);
                report.timed_out = true;
                finish(report, Vec::new())
            }
        }
    }
}

fn finish(report: TaskReport, records: Vec<Record>) -> TaskRun {
    let status = report.status();
    counter!("harvest_task_runs_total", 1u64, "task" => report.name.clone(), "outcome" => status);
    histogram!("harvest_task_duration_ms", report.duration_ms as f64, "task" => report.name.clone());
    match status {
        "ok" | "warning" => info!(task = %report.name, took_ms = report.duration_ms, records = records.len(), warnings = report.warnings.len(), "gather: task ok"),
        "panic" => error!(task = %report.name, panic = ?report.panic, "gather: task panicked"),
        _ => {
            let reason = report.errors.first().or(report.warnings.first()).map(String::as_str).unwrap_or_default();
            warn!(task = %report.name, error = %reason, timed_out = report.timed_out, "gather: task failed");
        }
    }
    TaskRun { report, records }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Merges task runs in order. Empty names are dropped; a repeated name keeps
/// the first record. Both become run errors.
fn aggregate(runs: Vec<TaskRun>) -> (Vec<Record>, Vec<TaskReport>, Vec<String>) {
    let mut owners: FxHashMap<String, String> = FxHashMap::default();
    let mut records = Vec::new();
    let mut reports = Vec::with_capacity(runs.len());
    let mut errors = Vec::new();
    for run in runs {
        let task = &run.report.name;
        for r in run.records {
            if r.name.is_empty() {
                errors.push(format!("task {task} emitted a record with an empty name"));
                continue;
            }
            match owners.entry(r.name.clone()) {
                Entry::Occupied(first) => {
                    errors.push(format!("duplicate record {} from {} and {task}; keeping the first", r.name, first.get()));
                }
                Entry::Vacant(slot) => {
                    slot.insert(task.clone());
                    records.push(r);
                }
            }
        }
        reports.push(run.report);
    }
    (records, reports, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::RawBytes;

    fn run(name: &str, records: &[&str]) -> TaskRun {
        let out = TaskOutput::from_records(records.iter().map(|n| Record::new(*n, RawBytes::text("x"))).collect());
        TaskRun { report: TaskReport::new(name, &out, Duration::ZERO), records: out.records }
    }

    #[test]
    fn duplicates_keep_the_first_and_name_both_tasks() {
        let (records, reports, errors) = aggregate(vec![run("g/a", &["config/x", "config/y"]), run("g/b", &["config/x"])]);
        assert_eq!(records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["config/x", "config/y"]);
        assert_eq!(reports.len(), 2);
        assert_eq!(errors, vec!["duplicate record config/x from g/a and g/b; keeping the first"]);
    }

    #[test]
    fn empty_names_are_run_errors() {
        let (records, _, errors) = aggregate(vec![run("g/a", &["", "config/ok"])]);
        assert_eq!(records.len(), 1);
        assert_eq!(errors, vec!["task g/a emitted a record with an empty name"]);
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic payload");
    }
}
