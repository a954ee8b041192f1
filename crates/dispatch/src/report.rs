//! Per-task reports and the run metadata record.

use std::time::Duration;

use harvest_core::{JsonMarshaller, Record, TaskOutput};
use serde::{Deserialize, Serialize};

/// Name of the metadata record every archive carries.
pub const METADATA_RECORD: &str = "insights-operator/gathers";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: String,
    pub duration_ms: u64,
    pub records_count: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub panic: Option<String>,
    pub timed_out: bool,
}

impl TaskReport {
    pub fn new(name: &str, out: &TaskOutput, took: Duration) -> Self {
        Self {
            name: name.to_string(),
            duration_ms: took.as_millis() as u64,
            records_count: out.records.len(),
            errors: out.errors().map(str::to_string).collect(),
            warnings: out.warnings().map(str::to_string).collect(),
            panic: None,
            timed_out: false,
        }
    }

    /// Metric label for the outcome.
    pub fn status(&self) -> &'static str {
        if self.panic.is_some() {
            "panic"
        } else if self.timed_out {
            "timeout"
        } else if !self.errors.is_empty() {
            "failed"
        } else if !self.warnings.is_empty() {
            "warning"
        } else {
            "ok"
        }
    }
}

/// Body of [`METADATA_RECORD`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub status_reports: Vec<TaskReport>,
    pub uptime_ms: u64,
    pub is_global_obfuscation_enabled: bool,
    pub disabled: Vec<String>,
    /// Faults found while aggregating, such as duplicate record names.
    pub errors: Vec<String>,
}

impl RunMetadata {
    pub fn record(&self) -> Record { Record::new(METADATA_RECORD, JsonMarshaller(self.clone())).always_stored() }
}
